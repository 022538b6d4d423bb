//! Configuration for the download orchestrator.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{FetchError, FetchResult};

/// Default number of concurrent transfers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

/// Default size of one ranged request in a chunked transfer.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 200_000;

/// Ordered list of request headers (name, value).
pub type RequestHeaders = Vec<(String, String)>;

/// Function deriving a destination filename from a URI.
pub type FilenameFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Where destination filenames come from when a target does not name its
/// own file.
#[derive(Clone)]
pub enum FilenameSource {
    /// Look the URI up in a fixed map.
    Map(HashMap<String, String>),
    /// Ask a caller-supplied function.
    Derive(FilenameFn),
}

impl Default for FilenameSource {
    fn default() -> Self {
        Self::Map(HashMap::new())
    }
}

impl fmt::Debug for FilenameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Derive(_) => f.write_str("Derive(<fn>)"),
        }
    }
}

impl FilenameSource {
    /// Resolves the filename for `uri`, if this source knows one.
    pub fn resolve(&self, uri: &str) -> Option<String> {
        match self {
            Self::Map(map) => map.get(uri).cloned(),
            Self::Derive(derive) => derive(uri),
        }
    }
}

/// Configuration for a [`Downloader`](crate::Downloader).
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Directory that receives every downloaded file.
    pub destination_dir: PathBuf,

    /// Maximum number of targets transferring at once.
    pub max_concurrency: usize,

    /// Timeout applied to every request unless a target overrides it.
    pub timeout: Duration,

    /// Delete completed and partial files when a run fails or is cancelled.
    pub abandon_on_failure: bool,

    /// Keep dispatching after a target fails.
    ///
    /// Ignored when `abandon_on_failure` is set.
    pub continue_after_failure: bool,

    /// Probe targets with HEAD and use ranged requests for large ones.
    pub try_chunked_transfer: bool,

    /// Bytes requested per range in a chunked transfer.
    pub chunk_size_bytes: u64,

    /// Headers sent with every request.
    pub request_headers: RequestHeaders,

    /// Filename resolution for targets registered without a filename.
    pub filenames: FilenameSource,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            destination_dir: PathBuf::from("."),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            abandon_on_failure: true,
            continue_after_failure: false,
            try_chunked_transfer: true,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            request_headers: Vec::new(),
            filenames: FilenameSource::default(),
        }
    }
}

impl DownloaderConfig {
    /// Create a new configuration downloading into `destination_dir`.
    pub fn new(destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            destination_dir: destination_dir.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of concurrent transfers.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable deleting files after a failed or cancelled run.
    pub fn with_abandon_on_failure(mut self, abandon: bool) -> Self {
        self.abandon_on_failure = abandon;
        self
    }

    /// Enable or disable continuing after a target fails.
    pub fn with_continue_after_failure(mut self, continue_after: bool) -> Self {
        self.continue_after_failure = continue_after;
        self
    }

    /// Enable or disable HEAD probing and chunked transfers.
    pub fn with_chunked_transfer(mut self, enabled: bool) -> Self {
        self.try_chunked_transfer = enabled;
        self
    }

    /// Set the number of bytes per ranged request.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }

    /// Map a URI to a destination filename.
    ///
    /// Replaces a derivation function set with [`with_filename_fn`](Self::with_filename_fn).
    pub fn with_filename(mut self, uri: impl Into<String>, filename: impl Into<String>) -> Self {
        match &mut self.filenames {
            FilenameSource::Map(map) => {
                map.insert(uri.into(), filename.into());
            }
            FilenameSource::Derive(_) => {
                let mut map = HashMap::new();
                map.insert(uri.into(), filename.into());
                self.filenames = FilenameSource::Map(map);
            }
        }
        self
    }

    /// Derive destination filenames with a function.
    pub fn with_filename_fn<F>(mut self, derive: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.filenames = FilenameSource::Derive(Arc::new(derive));
        self
    }

    /// Check the numeric settings.
    pub fn validate(&self) -> FetchResult<()> {
        if self.max_concurrency == 0 {
            return Err(FetchError::InvalidConcurrency(self.max_concurrency));
        }
        if self.chunk_size_bytes == 0 {
            return Err(FetchError::InvalidChunkSize);
        }
        Ok(())
    }
}

/// Per-target overrides of the downloader-wide settings.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    /// Explicit destination filename, taking precedence over the
    /// downloader's [`FilenameSource`].
    pub filename: Option<String>,

    /// Extra headers, appended after the downloader-wide ones.
    pub headers: RequestHeaders,

    /// Timeout override.
    pub timeout: Option<Duration>,

    /// Chunked-transfer override.
    pub try_chunked_transfer: Option<bool>,

    /// Expected SHA-256 of the finished file (lowercase hex).
    pub sha256: Option<String>,
}

impl TargetOptions {
    /// Options naming an explicit destination filename.
    pub fn named(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            ..Default::default()
        }
    }

    /// Add a header for this target only.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override chunked-transfer probing.
    pub fn with_chunked_transfer(mut self, enabled: bool) -> Self {
        self.try_chunked_transfer = Some(enabled);
        self
    }

    /// Require the finished file to match a SHA-256 digest.
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into().to_lowercase());
        self
    }
}
