use super::types::PeerIdentity;

/// Commands the session core sends down to the network task.
#[derive(Debug, Clone)]
pub enum NetworkCommand {
    /// Deliver one encoded frame to a peer over `/chat/1.0.0`.
    /// Fire-and-forget: no response is expected and delivery failure is
    /// only logged.
    SendFrame {
        peer: PeerIdentity,
        payload: Vec<u8>,
    },
    /// Issue a liveness probe to a connected peer.
    Probe { peer: PeerIdentity },
    /// Dial a peer manually by multiaddr.
    Dial { address: String },
}
