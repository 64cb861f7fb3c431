//! Error types for the Relay core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types, raised at the encoding/validation boundary
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// JSON boundary decoding error (non-numeric timestamp, unknown payload shape, ...)
    #[error("malformed event json: {0}")]
    Json(#[from] serde_json::Error),

    /// Hash mismatch (computed != transmitted hash)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Repeated field ordering violation
    #[error("repeated field not sorted/deduped: {field}")]
    UnsortedRepeatedField { field: String },

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Payload does not match the declared event type or violates its schema
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
