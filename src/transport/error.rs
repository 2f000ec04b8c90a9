//! Transport error taxonomy.

use std::time::Duration;

use crate::message::HeaderError;
use crate::substrate::SubstrateError;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by sockets, clients and listeners.
///
/// End-of-stream is not an error: `Socket::recv` reports it as `Ok(None)`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Publish or subscribe failed on the underlying substrate.
    #[error("Substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// No reply arrived within the dial deadline. Re-dialing may succeed.
    #[error("Timed out after {0:?} waiting for reply")]
    Timeout(Duration),

    /// The socket or client has already been closed.
    #[error("Connection closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// A socket handler gave up on its connection.
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl TransportError {
    /// Whether this is the recoverable dial timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}
