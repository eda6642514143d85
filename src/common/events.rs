use std::time::Duration;

use super::types::PeerIdentity;

/// Events the network task sends up to the session core.
///
/// Connect/disconnect notifications are only emitted for peers that speak
/// the chat protocol, and events for the same peer arrive in order.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A chat-capable peer became reachable.
    PeerConnected(PeerIdentity),
    /// A chat-capable peer went offline.
    PeerDisconnected(PeerIdentity),
    /// Exactly one already-delimited frame arrived from a peer.
    FrameReceived {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    /// Outcome of a liveness probe. Diagnostics only; a failed probe never
    /// marks a peer inactive.
    ProbeResult {
        peer: PeerIdentity,
        rtt: Option<Duration>,
    },
}
