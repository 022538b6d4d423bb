//! Download targets: one URI mapped to one local file.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use reqwest::Url;

use crate::config::{DownloaderConfig, RequestHeaders, TargetOptions};
use crate::error::{FetchError, FetchResult};

/// One entry of the work list.
///
/// Built once at registration from the downloader configuration merged with
/// the per-target [`TargetOptions`]; never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Source URI.
    pub uri: String,
    /// Full destination path (destination directory + filename).
    pub destination: PathBuf,
    /// Headers sent with every request for this target.
    pub headers: RequestHeaders,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Probe with HEAD and consider a chunked transfer.
    pub try_chunked_transfer: bool,
    /// Expected SHA-256 of the finished file.
    pub sha256: Option<String>,
}

impl Target {
    /// Resolve a target from a URI and its options.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUri`] if the URI does not parse
    /// - [`FetchError::MissingFilename`] if no filename can be resolved
    /// - [`FetchError::InvalidFilename`] if the filename is empty or escapes
    ///   the destination directory
    pub fn resolve(
        uri: &str,
        options: TargetOptions,
        config: &DownloaderConfig,
    ) -> FetchResult<Self> {
        validate_uri(uri)?;

        let filename = options
            .filename
            .or_else(|| config.filenames.resolve(uri))
            .ok_or_else(|| FetchError::MissingFilename {
                uri: uri.to_string(),
            })?;

        if !is_plain_relative(Path::new(&filename)) {
            return Err(FetchError::InvalidFilename {
                uri: uri.to_string(),
                filename,
            });
        }

        let mut headers = config.request_headers.clone();
        headers.extend(options.headers);

        Ok(Self {
            uri: uri.to_string(),
            destination: config.destination_dir.join(&filename),
            headers,
            timeout: options.timeout.unwrap_or(config.timeout),
            try_chunked_transfer: options
                .try_chunked_transfer
                .unwrap_or(config.try_chunked_transfer),
            sha256: options.sha256,
        })
    }
}

/// Check that `uri` is an absolute URI.
pub fn validate_uri(uri: &str) -> FetchResult<()> {
    Url::parse(uri)
        .map(|_| ())
        .map_err(|e| FetchError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
}

/// A relative path made only of normal components.
fn is_plain_relative(path: &Path) -> bool {
    let mut components = path.components().peekable();
    components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_)))
}
