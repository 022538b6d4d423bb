//! CLI error types.

use batchfetch::logging::LoggingError;
use batchfetch::{FetchError, TransportError};

/// Errors that end the command before or outside a download run.
///
/// Failed targets are not errors here; they are reported in the summary
/// and through the exit code.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Fetch(#[from] FetchError),

    #[error("failed to set up HTTP client: {0}")]
    Transport(#[from] TransportError),

    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
