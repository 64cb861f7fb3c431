//! Networking primitives for the Relay mesh
//!
//! This crate provides:
//! - Length-prefixed message framing
//! - Peer identity
//! - The `Transport` seam with TCP and in-memory implementations
//! - Wire messages for gossip, heartbeats and state exchange

pub mod framing;
pub mod peer;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameType};
pub use peer::{PeerId, PeerInfo};
pub use transport::{
    messages, MemoryNetwork, MemoryTransport, TcpTransport, Transport, TransportError,
    TransportEvent,
};
