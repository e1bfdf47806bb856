//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol records
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A record failed to parse as JSON
    #[error("Malformed record: {0}")]
    MalformedRecord(#[from] serde_json::Error),

    /// A binary payload was not valid base64
    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),

    /// A single record exceeds the maximum line length
    #[error("Record too large: {size} bytes exceeds maximum of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
