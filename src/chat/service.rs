//! The chat session service.
//!
//! Runs a single event loop over the network task's event channel, so all
//! presence notifications and inbound frames are applied to the session
//! store one at a time. The keep-alive scheduler ticks inside the same loop.
//! Encoding, lookup and append are synchronous; transport submission is a
//! non-blocking channel send.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use crate::chat::codec::Frame;
use crate::chat::persist::{self, PersistenceError};
use crate::chat::store::SessionStore;
use crate::chat::types::{ChatSession, Message};
use crate::common::{NetworkCommand, NetworkEvent, PeerIdentity};
use crate::storage::KvStore;

/// Failures surfaced by the service API.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The identity has no session; only presence events create sessions.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerIdentity),
    /// The wire format is line-delimited; a message containing a newline
    /// cannot be sent as a single frame.
    #[error("message contains an embedded newline")]
    EmbeddedNewline,
    #[error("persistence: {0}")]
    Persistence(#[from] PersistenceError),
}

pub struct ChatService {
    store: Arc<SessionStore>,
    kv: Arc<dyn KvStore>,
    command_tx: mpsc::Sender<NetworkCommand>,
    nickname: RwLock<Option<String>>,
    running: AtomicBool,
    shutdown: Notify,
    keep_alive: Duration,
}

impl ChatService {
    pub fn new(
        store: Arc<SessionStore>,
        kv: Arc<dyn KvStore>,
        command_tx: mpsc::Sender<NetworkCommand>,
        keep_alive: Duration,
    ) -> Arc<Self> {
        let nickname = persist::load_nickname(kv.as_ref());
        Arc::new(Self {
            store,
            kv,
            command_tx,
            nickname: RwLock::new(nickname),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            keep_alive,
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn local_nickname(&self) -> Option<String> {
        self.nickname
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Spawn the event loop. The service restores persisted sessions before
    /// touching any event, so no presence or frame event can observe a
    /// half-initialized store.
    pub fn start(self: Arc<Self>, event_rx: mpsc::Receiver<NetworkEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(event_rx))
    }

    pub async fn run(self: Arc<Self>, mut event_rx: mpsc::Receiver<NetworkEvent>) {
        if self.running.swap(true, Ordering::SeqCst) {
            log::warn!("chat service already running");
            return;
        }

        match persist::restore(&self.store, self.kv.as_ref()) {
            Ok(count) => log::info!("restored {count} chat sessions"),
            Err(err) => log::warn!("failed to restore chat sessions, starting empty: {err}"),
        }

        let mut keep_alive = interval_at(Instant::now() + self.keep_alive, self.keep_alive);
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = keep_alive.tick() => self.keep_alive_tick(),
                event = event_rx.recv() => match event {
                    Some(event) => self.apply_event(event),
                    None => {
                        log::info!("network event channel closed");
                        break;
                    }
                },
            }
        }
        self.teardown();
    }

    /// Stop the service. The run loop cancels the keep-alive task, forces
    /// every session inactive and takes a snapshot, in that order. Safe to
    /// call at any time; a no-op if the service is not running.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    fn teardown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.store.set_all_inactive();
        if let Err(err) = persist::snapshot(&self.store, self.kv.as_ref()) {
            log::warn!("failed to snapshot chat sessions on stop: {err}");
        }
        log::info!("chat service stopped");
    }

    pub(crate) fn apply_event(&self, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(identity) => self.on_peer_connected(identity),
            NetworkEvent::PeerDisconnected(identity) => self.on_peer_disconnected(&identity),
            NetworkEvent::FrameReceived { peer, payload } => self.on_frame(&peer, &payload),
            NetworkEvent::ProbeResult { peer, rtt } => match rtt {
                Some(rtt) => log::debug!("keep-alive probe to {peer}: {rtt:?}"),
                None => log::debug!("keep-alive probe to {peer} failed"),
            },
        }
    }

    fn on_peer_connected(&self, identity: PeerIdentity) {
        self.store.upsert_peer(identity.clone(), identity.short());
        self.store.set_active(&identity, true);
        // A repeated connect only re-triggers the nickname announcement.
        if let Some(nickname) = self.local_nickname() {
            self.send_frame(&identity, Frame::NicknameUpdate(nickname));
        }
    }

    fn on_peer_disconnected(&self, identity: &PeerIdentity) {
        if !self.store.set_active(identity, false) {
            log::debug!("disconnect for unknown peer {identity}");
        }
    }

    fn on_frame(&self, peer: &PeerIdentity, payload: &[u8]) {
        let frame = match Frame::decode(payload) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping undecodable frame from {peer}: {err}");
                return;
            }
        };
        // Frames never create sessions; a frame from a peer we have no
        // presence notification for is anomalous and discarded.
        match frame {
            Frame::ChatMessage(text) => {
                if !self.store.append_message(peer, Message::received(text)) {
                    log::warn!("dropping message from peer {peer} with no session");
                }
            }
            Frame::NicknameUpdate(name) => {
                if !self.store.set_display_name(peer, name) {
                    log::warn!("dropping nickname from peer {peer} with no session");
                }
            }
        }
    }

    /// Probe every active peer. Outcomes come back as `ProbeResult` events
    /// and are logged only; a failed probe never flips `is_active`.
    pub(crate) fn keep_alive_tick(&self) {
        for identity in self.store.active_peers() {
            let command = NetworkCommand::Probe {
                peer: identity.clone(),
            };
            if let Err(err) = self.command_tx.try_send(command) {
                log::debug!("keep-alive probe for {identity} not submitted: {err}");
            }
        }
    }

    fn send_frame(&self, peer: &PeerIdentity, frame: Frame) {
        let command = NetworkCommand::SendFrame {
            peer: peer.clone(),
            payload: frame.encode(),
        };
        // Fire-and-forget; delivery failures surface in the transport's logs.
        if let Err(err) = self.command_tx.try_send(command) {
            log::warn!("transport not accepting frames for {peer}: {err}");
        }
    }

    // ==================== caller-facing surface ====================

    pub fn list_sessions(&self) -> Vec<ChatSession> {
        self.store.list_sessions()
    }

    /// Append a sent message locally and hand the encoded frame to the
    /// transport. The append is synchronous, so callers see the message
    /// immediately; delivery is at-most-once with no acknowledgement, and a
    /// transport failure never retracts the appended message.
    pub fn send(&self, text: &str, to: &PeerIdentity) -> Result<Message, ChatError> {
        if text.contains('\n') {
            return Err(ChatError::EmbeddedNewline);
        }
        let message = Message::sent(text);
        if !self.store.append_message(to, message.clone()) {
            return Err(ChatError::UnknownPeer(to.clone()));
        }
        self.send_frame(to, Frame::ChatMessage(text.to_string()));
        Ok(message)
    }

    /// Remember the local nickname; it is announced to each peer on connect.
    /// The nickname travels as a single frame, so it is held to the same
    /// no-newline rule as message text.
    pub fn set_local_nickname(&self, name: &str) -> Result<(), ChatError> {
        if name.contains('\n') {
            return Err(ChatError::EmbeddedNewline);
        }
        *self.nickname.write().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
        persist::save_nickname(self.kv.as_ref(), name)?;
        Ok(())
    }

    /// Remove every session and immediately persist the now-empty store.
    pub fn delete_all_sessions(&self) {
        self.store.remove_all();
        if let Err(err) = persist::snapshot(&self.store, self.kv.as_ref()) {
            log::warn!("failed to persist empty session list: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::types::Direction;
    use crate::storage::MemoryStore;

    fn service() -> (Arc<ChatService>, mpsc::Receiver<NetworkCommand>) {
        service_with_kv(Arc::new(MemoryStore::default()))
    }

    fn service_with_kv(
        kv: Arc<dyn KvStore>,
    ) -> (Arc<ChatService>, mpsc::Receiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let service = ChatService::new(
            Arc::new(SessionStore::new()),
            kv,
            command_tx,
            Duration::from_secs(15),
        );
        (service, command_rx)
    }

    fn identity(s: &str) -> PeerIdentity {
        PeerIdentity::new(s)
    }

    #[test]
    fn presence_creates_one_session_and_tracks_activity() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");

        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        assert_eq!(service.list_sessions().len(), 1);
        assert!(service.store().session(&peer).unwrap().peer.is_active);

        service.apply_event(NetworkEvent::PeerDisconnected(peer.clone()));
        assert!(!service.store().session(&peer).unwrap().peer.is_active);

        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        assert!(service.store().session(&peer).unwrap().peer.is_active);
        assert_eq!(service.list_sessions().len(), 1);
    }

    #[test]
    fn disconnect_of_unknown_peer_creates_nothing() {
        let (service, _rx) = service();
        service.apply_event(NetworkEvent::PeerDisconnected(identity("ghost")));
        assert!(service.list_sessions().is_empty());
    }

    #[test]
    fn connect_announces_configured_nickname() {
        let (service, mut rx) = service();
        service.set_local_nickname("Bob").unwrap();
        let peer = identity("12D3KooWAlice");

        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        match rx.try_recv().unwrap() {
            NetworkCommand::SendFrame { peer: to, payload } => {
                assert_eq!(to, peer);
                assert_eq!(payload, b"nickname:Bob");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        // Repeated connect re-announces.
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            NetworkCommand::SendFrame { .. }
        ));
    }

    #[test]
    fn connect_without_nickname_announces_nothing() {
        let (service, mut rx) = service();
        service.apply_event(NetworkEvent::PeerConnected(identity("a")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn inbound_nickname_applies_only_to_known_peers() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");

        // Before any connect: no effect, no session.
        service.apply_event(NetworkEvent::FrameReceived {
            peer: peer.clone(),
            payload: b"nickname:Bob".to_vec(),
        });
        assert!(service.list_sessions().is_empty());

        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::FrameReceived {
            peer: peer.clone(),
            payload: b"nickname:Bob".to_vec(),
        });
        assert_eq!(
            service.store().session(&peer).unwrap().peer.display_name,
            "Bob"
        );
    }

    #[test]
    fn empty_nickname_frame_blanks_the_display_name() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::FrameReceived {
            peer: peer.clone(),
            payload: b"nickname:".to_vec(),
        });
        assert_eq!(service.store().session(&peer).unwrap().peer.display_name, "");
    }

    #[test]
    fn inbound_message_appends_received() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::FrameReceived {
            peer: peer.clone(),
            payload: b"hey there".to_vec(),
        });

        let session = service.store().session(&peer).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "hey there");
        assert_eq!(session.messages[0].direction, Direction::Received);
    }

    #[test]
    fn message_from_unknown_peer_is_dropped() {
        let (service, _rx) = service();
        service.apply_event(NetworkEvent::FrameReceived {
            peer: identity("ghost"),
            payload: b"boo".to_vec(),
        });
        assert!(service.list_sessions().is_empty());
    }

    #[test]
    fn undecodable_frame_is_dropped_without_panic() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::FrameReceived {
            peer: peer.clone(),
            payload: vec![0xff, 0xfe],
        });
        assert!(service.store().session(&peer).unwrap().messages.is_empty());
    }

    #[test]
    fn send_appends_synchronously_and_submits_frame() {
        let (service, mut rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));

        let message = service.send("hi", &peer).unwrap();
        assert_eq!(message.direction, Direction::Sent);
        assert_eq!(message.content, "hi");

        let session = service.store().session(&peer).unwrap();
        assert_eq!(session.messages, vec![message]);

        match rx.try_recv().unwrap() {
            NetworkCommand::SendFrame { peer: to, payload } => {
                assert_eq!(to, peer);
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn send_to_unknown_peer_mutates_nothing() {
        let (service, mut rx) = service();
        let err = service.send("hi", &identity("ghost")).unwrap_err();
        assert!(matches!(err, ChatError::UnknownPeer(_)));
        assert!(service.list_sessions().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_rejects_embedded_newlines() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        let err = service.send("two\nlines", &peer).unwrap_err();
        assert!(matches!(err, ChatError::EmbeddedNewline));
        assert!(service.store().session(&peer).unwrap().messages.is_empty());
    }

    #[test]
    fn nickname_rejects_embedded_newlines() {
        let (service, mut rx) = service();
        let err = service.set_local_nickname("a\nb").unwrap_err();
        assert!(matches!(err, ChatError::EmbeddedNewline));
        assert!(service.local_nickname().is_none());

        // Nothing to announce on connect either.
        service.apply_event(NetworkEvent::PeerConnected(identity("12D3KooWAlice")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn keep_alive_probes_only_active_peers() {
        let (service, mut rx) = service();
        let alice = identity("12D3KooWAlice");
        let bob = identity("12D3KooWBob");
        service.apply_event(NetworkEvent::PeerConnected(alice.clone()));
        service.apply_event(NetworkEvent::PeerConnected(bob.clone()));
        service.apply_event(NetworkEvent::PeerDisconnected(bob.clone()));

        service.keep_alive_tick();
        match rx.try_recv().unwrap() {
            NetworkCommand::Probe { peer } => assert_eq!(peer, alice),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn probe_failure_does_not_change_presence() {
        let (service, _rx) = service();
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer.clone()));
        service.apply_event(NetworkEvent::ProbeResult {
            peer: peer.clone(),
            rtt: None,
        });
        assert!(service.store().session(&peer).unwrap().peer.is_active);
    }

    #[test]
    fn nickname_survives_restart_via_kv() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        {
            let (service, _rx) = service_with_kv(kv.clone());
            service.set_local_nickname("Bob").unwrap();
        }
        let (service, _rx) = service_with_kv(kv);
        assert_eq!(service.local_nickname().as_deref(), Some("Bob"));
    }

    #[test]
    fn delete_all_clears_and_persists_empty() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let (service, _rx) = service_with_kv(kv.clone());
        let peer = identity("12D3KooWAlice");
        service.apply_event(NetworkEvent::PeerConnected(peer));

        service.delete_all_sessions();
        assert!(service.list_sessions().is_empty());

        // A fresh restore from the post-delete snapshot is also empty.
        let restored = SessionStore::new();
        assert_eq!(persist::restore(&restored, kv.as_ref()).unwrap(), 0);
        assert!(restored.is_empty());
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let (service, _rx) = service();
        service.stop();
        service.stop();
    }

    #[tokio::test]
    async fn run_restores_before_events_and_snapshots_on_stop() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::default());

        // Seed a snapshot of one prior conversation.
        let seed = SessionStore::new();
        let alice = identity("12D3KooWAlice");
        seed.upsert_peer(alice.clone(), alice.short());
        seed.set_display_name(&alice, "Alice");
        seed.append_message(&alice, Message::received("old message"));
        persist::snapshot(&seed, kv.as_ref()).unwrap();

        let (service, _command_rx) = service_with_kv(kv.clone());
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = service.clone().start(event_rx);

        // A connect for the restored peer must find the existing session.
        event_tx
            .send(NetworkEvent::PeerConnected(alice.clone()))
            .await
            .unwrap();
        drop(event_tx); // closes the channel, ending the run loop

        task.await.unwrap();

        let session = service.store().session(&alice).unwrap();
        assert_eq!(session.peer.display_name, "Alice");
        assert_eq!(session.messages.len(), 1);
        // Teardown forced everything inactive and snapshotted.
        assert!(!session.peer.is_active);
        let restored = SessionStore::new();
        assert_eq!(persist::restore(&restored, kv.as_ref()).unwrap(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_ends_the_loop() {
        let (service, _command_rx) = service();
        let (_event_tx, event_rx) = mpsc::channel(8);
        let task = service.clone().start(event_rx);

        // Give the loop a chance to start, then stop twice.
        tokio::task::yield_now().await;
        service.stop();
        service.stop();
        task.await.unwrap();
    }
}
