//! relayd - Relay integrity node
//!
//! This daemon provides:
//! - The event DAG with consensus rounds and bounded retention
//! - Epidemic gossip over a pluggable transport
//! - Fork detection and staged resolution
//! - Abuse detection (Sybil clusters, replays, coordination, timing)
//! - Partition detection, offline buffering and reconciliation

pub mod config;
pub mod event_store;
pub mod fork;
pub mod gossip;
pub mod integrity;
pub mod node;
pub mod partition;
pub mod reconcile;
pub mod scheduler;
pub mod sinks;
pub mod storage;

pub use config::{Config, NodeConfig};
pub use event_store::EventStore;
pub use fork::ForkResolver;
pub use gossip::GossipPropagator;
pub use integrity::IntegrityMonitor;
pub use node::{NodeEvent, RelayNode, TickKind};
pub use partition::PartitionCoordinator;
pub use scheduler::Scheduler;
pub use sinks::Sinks;
pub use storage::Storage;
