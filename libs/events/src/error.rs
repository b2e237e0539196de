//! Error types for event construction.

use thiserror::Error;

/// Errors that can occur when building or decoding events.
#[derive(Debug, Error)]
pub enum EventError {
    /// Payload failed to serialize or deserialize.
    #[error("event payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event type string is not one of the known constants.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
}
