//! Checkin error types.

use loco_session::SessionError;
use thiserror::Error;

/// Endpoint discovery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckinError {
    /// Connection or request failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Directory answered with a non-zero status
    #[error("{method} rejected with status {status}")]
    Rejected {
        /// Request method
        method: String,
        /// Status from the response body
        status: i64,
    },

    /// Response lacked a required field
    #[error("{method} response missing {field}")]
    MissingField {
        /// Request method
        method: String,
        /// Field name
        field: &'static str,
    },

    /// Directory returned no ticket hosts
    #[error("no ticket hosts available")]
    NoCandidates,

    /// Every ticket host/port pair failed
    #[error("ticket checkin exhausted after {attempts} attempts")]
    Exhausted {
        /// Pairs tried
        attempts: usize,
    },
}
