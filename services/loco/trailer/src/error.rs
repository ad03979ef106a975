//! Upload error types.

use std::fmt;

use loco_session::SessionError;
use thiserror::Error;

/// Upload protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadPhase {
    /// Announce the upload on the main session
    Ship,
    /// Resolve the trailer endpoint
    GetTrailer,
    /// Open the trailer session and describe the payload
    Post,
    /// Write payload bytes
    Stream,
    /// Wait for the completion push
    Complete,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadPhase::Ship => "SHIP",
            UploadPhase::GetTrailer => "GETTRAILER",
            UploadPhase::Post => "POST",
            UploadPhase::Stream => "stream",
            UploadPhase::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// Upload errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Session failure during a phase
    #[error("{phase} failed: {source}")]
    Session {
        /// Phase that failed
        phase: UploadPhase,
        /// Underlying session error
        #[source]
        source: SessionError,
    },

    /// Server answered with a non-zero status
    #[error("{phase} rejected with status {status}")]
    Rejected {
        /// Phase that was rejected
        phase: UploadPhase,
        /// Status from the response body
        status: i64,
    },

    /// Response lacked a required field
    #[error("{phase} response missing {field}")]
    MissingField {
        /// Phase whose response was incomplete
        phase: UploadPhase,
        /// Field name
        field: &'static str,
    },

    /// Resume offset outside the payload
    #[error("resume offset {offset} outside payload of {size} bytes")]
    InvalidOffset {
        /// Offset announced by the trailer
        offset: i64,
        /// Payload size
        size: u64,
    },

    /// No completion push arrived in time
    #[error("timed out waiting for COMPLETE")]
    CompleteTimeout,
}

impl UploadError {
    /// Attribute a session error to `phase`, lifting status failures
    pub fn in_phase(phase: UploadPhase, err: SessionError) -> Self {
        match err {
            SessionError::Status { status, .. } => UploadError::Rejected { phase, status },
            source => UploadError::Session { phase, source },
        }
    }

    /// Phase the error belongs to, if any
    pub fn phase(&self) -> Option<UploadPhase> {
        match self {
            UploadError::Session { phase, .. }
            | UploadError::Rejected { phase, .. }
            | UploadError::MissingField { phase, .. } => Some(*phase),
            UploadError::InvalidOffset { .. } => Some(UploadPhase::Post),
            UploadError::CompleteTimeout => Some(UploadPhase::Complete),
        }
    }
}
