//! Terminal failures of a single identify run.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the identify workflow and the readiness gate.
///
/// Every variant is terminal for the call that produced it; nothing here is
/// retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifyError {
    #[error("invalid peer id or multiaddr {input:?}: {reason}")]
    InvalidInput { input: String, reason: String },

    #[error("timed out searching the DHT for peer {peer}")]
    ResolutionTimeout { peer: String },

    #[error("could not resolve peer {peer}: {reason}")]
    ResolutionFailed { peer: String, reason: String },

    #[error("timed out connecting to {target}")]
    DialTimeout { target: String },

    #[error("failed to connect to {target}: {reason}")]
    DialFailed { target: String, reason: String },

    #[error("timed out waiting for identify response from {peer}")]
    HandshakeTimeout { peer: String },

    #[error("identify with {peer} failed: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    #[error("no peers connected after {waited:?}")]
    NotReady { waited: Duration },
}

/// Flat discriminant of [`IdentifyError`], convenient for status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    ResolutionTimeout,
    ResolutionFailed,
    DialTimeout,
    DialFailed,
    HandshakeTimeout,
    HandshakeFailed,
    NotReady,
}

impl ErrorKind {
    /// Whether this kind is produced by an elapsed deadline.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            ErrorKind::ResolutionTimeout | ErrorKind::DialTimeout | ErrorKind::HandshakeTimeout
        )
    }
}

impl IdentifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentifyError::InvalidInput { .. } => ErrorKind::InvalidInput,
            IdentifyError::ResolutionTimeout { .. } => ErrorKind::ResolutionTimeout,
            IdentifyError::ResolutionFailed { .. } => ErrorKind::ResolutionFailed,
            IdentifyError::DialTimeout { .. } => ErrorKind::DialTimeout,
            IdentifyError::DialFailed { .. } => ErrorKind::DialFailed,
            IdentifyError::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            IdentifyError::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            IdentifyError::NotReady { .. } => ErrorKind::NotReady,
        }
    }

    pub(crate) fn invalid_input(input: &str, reason: impl ToString) -> Self {
        IdentifyError::InvalidInput {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}
