//! Client error types

use serde_json::Value;
use thiserror::Error;

use pod_protocol::ProtocolError;

use crate::lifecycle::CloseReason;

/// Errors surfaced to callers of the pod client
#[derive(Error, Debug)]
pub enum ClientError {
    /// The connection is not open
    #[error("Not connected")]
    NotConnected,

    /// The connection closed while the call was outstanding, or before it
    /// could be sent
    #[error("Connection closed: {0}")]
    Closed(CloseReason),

    /// The server answered the call with an error payload
    #[error("Remote error: {0}")]
    Remote(Value),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response body did not have the shape the method promises
    #[error("Unexpected response body: {0}")]
    UnexpectedBody(String),
}
