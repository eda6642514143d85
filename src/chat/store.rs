//! In-memory directory of chat sessions.
//!
//! The store is the single shared mutable resource of the session core.
//! Every mutation takes the store-wide lock, so two events for the same peer
//! can never interleave destructively, and readers only ever observe fully
//! applied mutations. After each mutation the store broadcasts a change
//! notification for front ends to re-render from.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;

use crate::chat::types::{ChatSession, Message, Person};
use crate::common::PeerIdentity;

const EVENT_CAPACITY: usize = 256;

/// Change notification emitted after a store mutation.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    SessionCreated(PeerIdentity),
    PresenceChanged {
        identity: PeerIdentity,
        is_active: bool,
    },
    DisplayNameChanged {
        identity: PeerIdentity,
        display_name: String,
    },
    MessageAppended {
        identity: PeerIdentity,
        message: Message,
    },
    Cleared,
}

struct Inner {
    sessions: HashMap<PeerIdentity, ChatSession>,
    /// Identity insertion order; listing stays stable for a store instance.
    order: Vec<PeerIdentity>,
}

pub struct SessionStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                order: Vec::new(),
            }),
            events,
        }
    }

    /// Subscribe to change notifications. Slow subscribers may observe
    /// `Lagged` and should re-read the store.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self, event: StoreEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Return the session for `identity`, creating an inactive one with the
    /// given default display name if none exists.
    pub fn upsert_peer(
        &self,
        identity: PeerIdentity,
        default_display_name: impl Into<String>,
    ) -> ChatSession {
        let mut inner = self.write();
        if let Some(session) = inner.sessions.get(&identity) {
            return session.clone();
        }
        let session = ChatSession::new(Person::new(identity.clone(), default_display_name));
        inner.sessions.insert(identity.clone(), session.clone());
        inner.order.push(identity.clone());
        drop(inner);
        self.notify(StoreEvent::SessionCreated(identity));
        session
    }

    /// Flip a session's connectivity flag. Returns false (and does nothing)
    /// for unknown identities.
    pub fn set_active(&self, identity: &PeerIdentity, is_active: bool) -> bool {
        let mut inner = self.write();
        let Some(session) = inner.sessions.get_mut(identity) else {
            return false;
        };
        session.peer.is_active = is_active;
        drop(inner);
        self.notify(StoreEvent::PresenceChanged {
            identity: identity.clone(),
            is_active,
        });
        true
    }

    /// Update a session's display name. A nickname for an unknown peer is
    /// dropped; it never creates a session.
    pub fn set_display_name(&self, identity: &PeerIdentity, name: impl Into<String>) -> bool {
        let name = name.into();
        let mut inner = self.write();
        let Some(session) = inner.sessions.get_mut(identity) else {
            return false;
        };
        session.peer.display_name = name.clone();
        drop(inner);
        self.notify(StoreEvent::DisplayNameChanged {
            identity: identity.clone(),
            display_name: name,
        });
        true
    }

    /// Append a message to a session. Returns false for unknown identities.
    pub fn append_message(&self, identity: &PeerIdentity, message: Message) -> bool {
        let mut inner = self.write();
        let Some(session) = inner.sessions.get_mut(identity) else {
            return false;
        };
        session.messages.push(message.clone());
        drop(inner);
        self.notify(StoreEvent::MessageAppended {
            identity: identity.clone(),
            message,
        });
        true
    }

    pub fn session(&self, identity: &PeerIdentity) -> Option<ChatSession> {
        self.read().sessions.get(identity).cloned()
    }

    /// All sessions, in insertion order.
    pub fn list_sessions(&self) -> Vec<ChatSession> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|identity| inner.sessions.get(identity).cloned())
            .collect()
    }

    /// Identities of peers currently marked active.
    pub fn active_peers(&self) -> Vec<PeerIdentity> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter(|identity| {
                inner
                    .sessions
                    .get(identity)
                    .is_some_and(|s| s.peer.is_active)
            })
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read().sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    /// Drop every session.
    pub fn remove_all(&self) {
        let mut inner = self.write();
        inner.sessions.clear();
        inner.order.clear();
        drop(inner);
        self.notify(StoreEvent::Cleared);
    }

    /// Force every session inactive, e.g. when the transport is stopped.
    pub fn set_all_inactive(&self) {
        let changed: Vec<PeerIdentity> = {
            let mut inner = self.write();
            let mut changed = Vec::new();
            for (identity, session) in inner.sessions.iter_mut() {
                if session.peer.is_active {
                    session.peer.is_active = false;
                    changed.push(identity.clone());
                }
            }
            changed
        };
        for identity in changed {
            self.notify(StoreEvent::PresenceChanged {
                identity,
                is_active: false,
            });
        }
    }

    /// Replace the full contents, used when restoring a snapshot.
    pub fn replace_all(&self, sessions: Vec<ChatSession>) {
        let identities: Vec<PeerIdentity> = {
            let mut inner = self.write();
            inner.sessions.clear();
            inner.order.clear();
            for session in sessions {
                let identity = session.peer.identity.clone();
                if inner.sessions.insert(identity.clone(), session).is_none() {
                    inner.order.push(identity);
                }
            }
            inner.order.clone()
        };
        for identity in identities {
            self.notify(StoreEvent::SessionCreated(identity));
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn identity(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    #[test]
    fn upsert_is_idempotent_per_identity() {
        let store = SessionStore::new();
        store.upsert_peer(identity("a"), "a-short");
        store.append_message(&identity("a"), Message::received("hi"));
        let again = store.upsert_peer(identity("a"), "other-default");

        assert_eq!(store.len(), 1);
        assert_eq!(again.peer.display_name, "a-short");
        assert_eq!(again.messages.len(), 1);
    }

    #[test]
    fn mutations_on_unknown_identities_are_noops() {
        let store = SessionStore::new();
        assert!(!store.set_active(&identity("ghost"), true));
        assert!(!store.set_display_name(&identity("ghost"), "Bob"));
        assert!(!store.append_message(&identity("ghost"), Message::received("x")));
        assert!(store.is_empty());
    }

    #[test]
    fn listing_keeps_insertion_order() {
        let store = SessionStore::new();
        for name in ["c", "a", "b"] {
            store.upsert_peer(identity(name), name);
        }
        let listed: Vec<String> = store
            .list_sessions()
            .into_iter()
            .map(|s| s.peer.display_name)
            .collect();
        assert_eq!(listed, ["c", "a", "b"]);
    }

    #[test]
    fn active_peers_tracks_presence() {
        let store = SessionStore::new();
        store.upsert_peer(identity("a"), "a");
        store.upsert_peer(identity("b"), "b");
        store.set_active(&identity("a"), true);
        store.set_active(&identity("b"), true);
        store.set_active(&identity("b"), false);

        assert_eq!(store.active_peers(), vec![identity("a")]);

        store.set_all_inactive();
        assert!(store.active_peers().is_empty());
    }

    #[test]
    fn remove_all_empties_the_store() {
        let store = SessionStore::new();
        store.upsert_peer(identity("a"), "a");
        store.remove_all();
        assert!(store.list_sessions().is_empty());
    }

    #[test]
    fn replace_all_installs_snapshot_contents() {
        let store = SessionStore::new();
        store.upsert_peer(identity("old"), "old");

        let restored = vec![
            ChatSession::new(Person::new(identity("x"), "X")),
            ChatSession::new(Person::new(identity("y"), "Y")),
        ];
        store.replace_all(restored);

        let names: Vec<String> = store
            .list_sessions()
            .into_iter()
            .map(|s| s.peer.display_name)
            .collect();
        assert_eq!(names, ["X", "Y"]);
        assert!(store.session(&identity("old")).is_none());
    }

    #[test]
    fn concurrent_mutations_for_one_identity_lose_nothing() {
        let store = Arc::new(SessionStore::new());
        store.upsert_peer(identity("p"), "p");

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    store.append_message(&identity("p"), Message::received(format!("{i}:{j}")));
                    store.set_active(&identity("p"), j % 2 == 0);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let session = store.session(&identity("p")).unwrap();
        assert_eq!(session.messages.len(), 8 * 50);
    }
}
