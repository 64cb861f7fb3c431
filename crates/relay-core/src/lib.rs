//! Relay Core Library
//!
//! This crate provides the event data model, canonical encoding, and
//! cryptographic primitives for the Relay integrity DAG.
//!
//! # Modules
//!
//! - [`types`]: Core types (Event, payload union, GossipEnvelope, ids)
//! - [`canonical`]: Deterministic serialization and boundary validation
//! - [`crypto`]: Hash derivations and signature utilities
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
