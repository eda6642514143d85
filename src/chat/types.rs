//! Domain model for per-peer chat sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::PeerIdentity;

/// Whether a message was written locally or received from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// A single chat message. Immutable once created; sessions only ever append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub direction: Direction,
}

impl Message {
    fn new(content: impl Into<String>, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            content: content.into(),
            direction,
        }
    }

    /// A message written locally, about to be handed to the transport.
    pub fn sent(content: impl Into<String>) -> Self {
        Self::new(content, Direction::Sent)
    }

    /// A message that arrived from the remote peer.
    pub fn received(content: impl Into<String>) -> Self {
        Self::new(content, Direction::Received)
    }
}

/// A remote participant as the local node sees it.
///
/// `is_active` mirrors current transport-level connectivity for the chat
/// protocol. It is derived state and deliberately excluded from
/// serialization, so a restored person always starts inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub identity: PeerIdentity,
    pub display_name: String,
    #[serde(skip, default)]
    pub is_active: bool,
}

impl Person {
    pub fn new(identity: PeerIdentity, display_name: impl Into<String>) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            is_active: false,
        }
    }
}

/// The local record of a conversation with one peer.
///
/// Messages are kept in insertion order, which is the chronological order of
/// local append (wall-clock ordering across both sides is not guaranteed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub peer: Person,
    pub messages: Vec<Message>,
}

impl ChatSession {
    pub fn new(peer: Person) -> Self {
        Self {
            peer,
            messages: Vec::new(),
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_direction() {
        let sent = Message::sent("hi");
        let received = Message::received("hello");
        assert_eq!(sent.direction, Direction::Sent);
        assert_eq!(received.direction, Direction::Received);
        assert_ne!(sent.id, received.id);
    }

    #[test]
    fn is_active_does_not_survive_serialization() {
        let mut session = ChatSession::new(Person::new(
            PeerIdentity::new("12D3KooWTest"),
            "Alice",
        ));
        session.peer.is_active = true;
        session.messages.push(Message::received("hey"));

        let json = serde_json::to_vec(&session).unwrap();
        let restored: ChatSession = serde_json::from_slice(&json).unwrap();

        assert!(!restored.peer.is_active);
        assert_eq!(restored.peer.display_name, "Alice");
        assert_eq!(restored.messages, session.messages);
    }

    #[test]
    fn last_message_is_latest_append() {
        let mut session = ChatSession::new(Person::new(PeerIdentity::new("p"), "p"));
        assert!(session.last_message().is_none());
        session.messages.push(Message::sent("one"));
        session.messages.push(Message::received("two"));
        assert_eq!(session.last_message().unwrap().content, "two");
    }
}
