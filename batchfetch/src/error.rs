//! Error types for the download orchestrator.
//!
//! Errors fall into three families:
//!
//! - **Configuration** errors are raised synchronously when targets are
//!   registered or a [`Downloader`](crate::Downloader) is constructed. They
//!   are never retried.
//! - **State** errors are raised when an operation is invalid for the
//!   current run phase (double start, reset while running, unknown URI).
//!   They fail fast and change nothing.
//! - **Transport** errors ([`TransportError`]) come from the injected
//!   transport. They never cross the task boundary as a `Result`; they are
//!   recorded on the fulfiller and surfaced through
//!   [`DownloadEvent::TargetFailed`](crate::DownloadEvent::TargetFailed).
//!
//! A server that does not support HEAD or byte ranges is not an error at
//! all: the fulfiller silently falls back to a single-shot transfer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for orchestrator operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// Errors returned synchronously by the orchestrator API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URI could not be parsed.
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// `max_concurrency` was zero.
    #[error("max concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// `chunk_size_bytes` was zero.
    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,

    /// Neither an explicit filename, the filename map, nor the derivation
    /// function produced a filename for this URI.
    #[error("no filename mapping for {uri}")]
    MissingFilename { uri: String },

    /// The resolved filename is empty or would leave the destination
    /// directory.
    #[error("invalid filename {filename:?} for {uri}")]
    InvalidFilename { uri: String, filename: String },

    /// The URI is already registered with this downloader.
    #[error("target already registered: {uri}")]
    DuplicateTarget { uri: String },

    /// Another registered target already writes to the same file.
    #[error("{uri} would write {}, already the destination of {existing}", path.display())]
    DuplicateDestination {
        uri: String,
        path: PathBuf,
        existing: String,
    },

    /// `start` was called while a run is active.
    #[error("a run is already active")]
    AlreadyRunning,

    /// `start` was called with nothing queued.
    #[error("no pending targets to download")]
    NothingPending,

    /// A finished run must be reset before another run can start.
    #[error("previous run has finished; call reset() before starting again")]
    ResetRequired,

    /// `reset` was called while a run is active.
    #[error("cannot reset while a run is active; cancel it first")]
    RunActive,

    /// The URI was never registered with this downloader.
    #[error("unknown target: {uri}")]
    NotFound { uri: String },

    /// Failed to prepare the destination directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },
}

impl FetchError {
    /// Returns true for errors caused by invalid configuration or input.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. }
                | Self::InvalidConcurrency(_)
                | Self::InvalidChunkSize
                | Self::MissingFilename { .. }
                | Self::InvalidFilename { .. }
                | Self::DuplicateTarget { .. }
                | Self::DuplicateDestination { .. }
                | Self::CreateDirFailed { .. }
        )
    }

    /// Returns true for errors caused by calling an operation in the wrong
    /// run phase.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning
                | Self::NothingPending
                | Self::ResetRequired
                | Self::RunActive
                | Self::NotFound { .. }
        )
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport) or by the
/// fulfiller while validating what the transport wrote.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection-level failure.
    #[error("request to {uri} failed: {reason}")]
    Network { uri: String, reason: String },

    /// The server answered with a non-success status.
    #[error("{uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    /// The request exceeded its timeout.
    #[error("request to {uri} timed out after {timeout_secs}s")]
    Timeout { uri: String, timeout_secs: u64 },

    /// Reading or writing the destination file failed.
    #[error("I/O error on {}: {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    /// A ranged request was answered with something other than the
    /// requested span.
    #[error("{uri} did not honor range request {range}")]
    RangeNotHonored { uri: String, range: String },

    /// The file on disk disagrees with the size announced by the server.
    #[error("size mismatch for {}: expected {expected} bytes, found {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// The finished file does not match its expected SHA-256 digest.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl TransportError {
    /// Numeric code reported through the per-target error signal.
    ///
    /// This is the HTTP status for [`TransportError::Status`] and 0 for
    /// everything else.
    pub fn code(&self) -> i32 {
        match self {
            Self::Status { status, .. } => i32::from(*status),
            _ => 0,
        }
    }

    /// Builds an [`TransportError::Io`] from an I/O error.
    pub fn io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self::Io {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_classification() {
        assert!(FetchError::AlreadyRunning.is_state_error());
        assert!(FetchError::RunActive.is_state_error());
        assert!(FetchError::NotFound {
            uri: "http://a".to_string()
        }
        .is_state_error());
        assert!(!FetchError::InvalidChunkSize.is_state_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(FetchError::InvalidConcurrency(0).is_config_error());
        assert!(FetchError::MissingFilename {
            uri: "http://a".to_string()
        }
        .is_config_error());
        assert!(FetchError::DuplicateDestination {
            uri: "http://b/f.bin".to_string(),
            path: PathBuf::from("/downloads/f.bin"),
            existing: "http://a/f.bin".to_string(),
        }
        .is_config_error());
        assert!(!FetchError::NothingPending.is_config_error());
    }

    #[test]
    fn test_transport_error_code() {
        let err = TransportError::Status {
            uri: "http://a".to_string(),
            status: 404,
        };
        assert_eq!(err.code(), 404);
        assert_eq!(err.to_string(), "http://a returned HTTP 404");

        let err = TransportError::Timeout {
            uri: "http://a".to_string(),
            timeout_secs: 6,
        };
        assert_eq!(err.code(), 0);
        assert!(err.to_string().contains("timed out after 6s"));
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = TransportError::ChecksumMismatch {
            path: PathBuf::from("/tmp/a.bin"),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("def456"));
    }
}
