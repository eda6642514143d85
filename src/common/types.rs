use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a remote participant, derived from its public key.
///
/// Wraps the base58 rendering of a libp2p `PeerId`. Immutable once
/// established; equality on it is what keeps sessions unique per peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short rendering used as the default display name before a peer
    /// announces a nickname, e.g. `12D3KooW…h1QeW`.
    ///
    /// Counts characters, not bytes, so an identity that is not plain
    /// base58 still abbreviates cleanly.
    pub fn short(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 16 {
            return self.0.clone();
        }
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 5..].iter().collect();
        format!("{head}…{tail}")
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<libp2p::PeerId> for PeerIdentity {
    fn from(peer: libp2p::PeerId) -> Self {
        Self(peer.to_base58())
    }
}
