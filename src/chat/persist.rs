//! Persistence bridge between the session store and the opaque key-value
//! store. Snapshots hold identity, display name and messages; `is_active`
//! is derived transport state and is reset on restore.

use thiserror::Error;

use crate::chat::store::SessionStore;
use crate::chat::types::ChatSession;
use crate::storage::{KvStore, StorageError};

/// Key under which the session snapshot lives.
pub const CHATS_KEY: &str = "chats";
/// Key under which the local nickname lives.
pub const NICKNAME_KEY: &str = "nickname";
/// Key under which the local identity keypair lives (protobuf-encoded).
pub const IDENTITY_KEY: &str = "identity";

/// Snapshot/restore failures. Never fatal: the in-memory store stays
/// authoritative and the process continues with what it has.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Serialize every session to the store.
pub fn snapshot(store: &SessionStore, kv: &dyn KvStore) -> Result<(), PersistenceError> {
    let sessions = store.list_sessions();
    let payload = serde_json::to_vec(&sessions)?;
    kv.set(CHATS_KEY, &payload)?;
    log::debug!("snapshotted {} chat sessions", sessions.len());
    Ok(())
}

/// Load the snapshot into `store`, replacing its contents. Every restored
/// session starts inactive regardless of what was live when the snapshot was
/// taken. A missing snapshot is not an error and leaves the store empty.
pub fn restore(store: &SessionStore, kv: &dyn KvStore) -> Result<usize, PersistenceError> {
    let Some(payload) = kv.get(CHATS_KEY)? else {
        return Ok(0);
    };
    let mut sessions: Vec<ChatSession> = serde_json::from_slice(&payload)?;
    for session in &mut sessions {
        session.peer.is_active = false;
    }
    let count = sessions.len();
    store.replace_all(sessions);
    Ok(count)
}

pub fn load_nickname(kv: &dyn KvStore) -> Option<String> {
    match kv.get(NICKNAME_KEY) {
        Ok(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(name) => Some(name),
            Err(err) => {
                log::warn!("stored nickname is not UTF-8, ignoring: {err}");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            log::warn!("failed to read stored nickname: {err}");
            None
        }
    }
}

pub fn save_nickname(kv: &dyn KvStore, name: &str) -> Result<(), PersistenceError> {
    kv.set(NICKNAME_KEY, name.as_bytes())?;
    Ok(())
}
