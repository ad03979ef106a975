//! Session error types.

use loco_wire::{CryptoError, DocumentError, WireError};
use thiserror::Error;

/// Session errors
///
/// Every variant is cheap to clone so one failure can be delivered to all
/// waiters and to the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// TCP connection could not be established
    #[error("connect to {endpoint} failed: {reason}")]
    Connect {
        /// Target endpoint
        endpoint: String,
        /// Underlying cause
        reason: String,
    },

    /// TCP or TLS connection did not complete in time
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    /// TLS setup or handshake failure
    #[error("tls error: {0}")]
    Tls(String),

    /// Socket read or write failure
    #[error("io error: {0}")]
    Io(String),

    /// Request could not be framed (bad method name, oversized body)
    #[error("invalid request: {0}")]
    Request(WireError),

    /// Undecodable inbound stream; fatal to the session
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Handshake or encryption failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Request received no response in time
    #[error("{method} request {packet_id} timed out")]
    Timeout {
        /// Request method
        method: String,
        /// Request packet id
        packet_id: i32,
    },

    /// Response carried a non-zero application status
    #[error("{method} request {packet_id} failed with status {status}")]
    Status {
        /// Request method
        method: String,
        /// Request packet id
        packet_id: i32,
        /// Status from the response body
        status: i64,
    },

    /// Response body could not be interpreted
    #[error("{method} response body invalid: {reason}")]
    Body {
        /// Request method
        method: String,
        /// What was wrong
        reason: String,
    },

    /// The connection dropped while the operation was outstanding
    #[error("session disconnected")]
    Disconnected,

    /// The session was closed locally
    #[error("session closed")]
    Closed,

    /// Too many consecutive keepalive failures
    #[error("keepalive failed {0} times in a row")]
    Keepalive(u32),
}

impl SessionError {
    /// Wrap a body encode/decode failure for `method`
    pub fn body(method: &str, err: DocumentError) -> Self {
        SessionError::Body {
            method: method.to_string(),
            reason: err.to_string(),
        }
    }

    /// Whether the error ends the session rather than a single request
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::Request(_)
                | SessionError::Timeout { .. }
                | SessionError::Status { .. }
                | SessionError::Body { .. }
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}
