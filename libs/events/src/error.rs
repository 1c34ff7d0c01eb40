//! Error types for event decoding.

use thiserror::Error;

/// Errors that can occur when decoding feed lines.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The line was empty after trimming.
    #[error("empty event line")]
    Empty,

    /// The line was not a valid event object.
    #[error("malformed event: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Malformed(err.to_string())
    }
}
