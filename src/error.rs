//! Error types for lansync operations.

use thiserror::Error;

/// Errors that can occur during synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on a peer socket: oversized, truncated, or
    /// undecodable payload.
    #[error("Frame error: {0}")]
    Frame(String),

    /// Peer sent a message that violates the session protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A second session for the same peer lost the duplicate tie-break.
    #[error("Duplicate session for peer")]
    DuplicateSession,

    /// A session's bounded send queue overflowed.
    #[error("Send queue overflow")]
    Backpressure,

    /// A delta arrived for a path with no local base file to patch.
    #[error("No base file for delta: {0}")]
    MissingBase(String),

    /// A path that is absolute, escapes the monitored root, or is
    /// otherwise not a valid relative identifier.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Signature data could not be produced, parsed, or persisted.
    #[error("Signature error: {0}")]
    Signature(String),

    /// Delta computation or application failed.
    #[error("Delta error: {0}")]
    Delta(String),

    /// Filesystem watcher could not be set up or failed at runtime.
    #[error("Watcher error: {0}")]
    Watch(String),

    /// Invalid configuration detected at startup. Fatal.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for lansync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether this error must terminate the session it occurred on.
    ///
    /// Per-message failures (`MissingBase`, `InvalidPath`, apply I/O,
    /// delta mismatches) are dropped and logged; everything else closes
    /// the offending session.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Frame(_) | Self::Protocol(_) | Self::DuplicateSession | Self::Backpressure
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = SyncError::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn error_display_frame() {
        let err = SyncError::Frame("length 99 exceeds cap".to_string());
        assert!(err.to_string().contains("Frame error"));
        assert!(err.to_string().contains("exceeds cap"));
    }

    #[test]
    fn error_display_missing_base() {
        let err = SyncError::MissingBase("docs/a.txt".to_string());
        assert!(err.to_string().contains("docs/a.txt"));
    }

    #[test]
    fn error_display_invalid_path() {
        let err = SyncError::InvalidPath("../escape".to_string());
        assert!(err.to_string().contains("Invalid path"));
    }

    #[test]
    fn session_fatal_classification() {
        assert!(SyncError::Frame("x".into()).is_session_fatal());
        assert!(SyncError::Protocol("x".into()).is_session_fatal());
        assert!(SyncError::DuplicateSession.is_session_fatal());
        assert!(SyncError::Backpressure.is_session_fatal());

        assert!(!SyncError::MissingBase("x".into()).is_session_fatal());
        assert!(!SyncError::InvalidPath("x".into()).is_session_fatal());
        assert!(!SyncError::Delta("x".into()).is_session_fatal());
        let io_err = std::io::Error::other("disk");
        assert!(!SyncError::Io(io_err).is_session_fatal());
    }

    #[test]
    fn result_type_ok() {
        let result: Result<i32> = Ok(42);
        assert_eq!(result.unwrap_or(0), 42);
    }
}
