//! Presence-aware chat sessions layered on the p2p transport.
//!
//! - per-peer sessions (identity, nickname, messages, activity)
//! - presence handling and the nickname handshake
//! - inbound frame dispatch and the outbound send path
//! - keep-alive scheduling against the idle-connection timeout
//! - snapshot/restore through the opaque key-value store

pub mod codec;
pub mod persist;
pub mod service;
pub mod store;
pub mod types;

pub use service::ChatService;
pub use store::{SessionStore, StoreEvent};
pub use types::Direction;
