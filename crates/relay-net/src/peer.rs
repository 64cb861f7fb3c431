//! Peer identity and information

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Unique peer identifier (node id announced in the Hello handshake)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random node id (hex of 16 random bytes)
    pub fn random() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Information about a peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identifier
    pub id: PeerId,
    /// Network address, when known
    pub addr: Option<SocketAddr>,
    /// When the connection was established (unix millis)
    pub connected_at: u64,
    /// Last seen timestamp (unix millis)
    pub last_seen: u64,
}

impl PeerInfo {
    /// Create new peer info
    pub fn new(id: PeerId, addr: Option<SocketAddr>) -> Self {
        let now = relay_core::now_millis();
        Self {
            id,
            addr,
            connected_at: now,
            last_seen: now,
        }
    }

    /// Update last seen time
    pub fn touch(&mut self) {
        self.last_seen = relay_core::now_millis();
    }
}
