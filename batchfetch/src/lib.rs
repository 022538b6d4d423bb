//! batchfetch - concurrent multi-file downloads
//!
//! Fetches a batch of remote resources to local files with a bounded number
//! of concurrent transfers. Large resources on servers that accept byte
//! ranges are fetched in sequential chunks; everything else in one request.
//! A failing target either stops the run (optionally deleting what was
//! written) or is recorded while the rest continue.
//!
//! # Architecture
//!
//! - [`transport`] - the HEAD / ranged GET capability ([`HttpTransport`],
//!   [`MemoryTransport`])
//! - [`fulfiller`] - per-target transfer state machine
//! - [`dispatch_lock`] - serializes completion handling
//! - [`orchestrator`] - the [`Downloader`]: target sets, dispatch, policy,
//!   events and queries
//!
//! # Example
//!
//! ```no_run
//! use batchfetch::{Downloader, DownloaderConfig, DownloadEvent, HttpTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DownloaderConfig::new("downloads")
//!     .with_max_concurrency(4)
//!     .with_continue_after_failure(true)
//!     .with_abandon_on_failure(false)
//!     .with_filename_fn(|uri| uri.rsplit('/').next().map(str::to_string));
//!
//! let downloader = Downloader::new(config, HttpTransport::new()?)?;
//! downloader.on_event(|event| {
//!     if let DownloadEvent::TargetFailed { uri, message, .. } = event {
//!         eprintln!("{uri}: {message}");
//!     }
//! });
//! downloader.add_targets([
//!     "https://example.com/a.bin",
//!     "https://example.com/b.bin",
//! ])?;
//!
//! let outcome = downloader.run().await?;
//! println!("{} ok, {} failed", outcome.completed.len(), outcome.failed.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch_lock;
pub mod error;
pub mod fulfiller;
pub mod logging;
pub mod orchestrator;
pub mod target;
pub mod transport;

pub use config::{DownloaderConfig, FilenameSource, TargetOptions};
pub use dispatch_lock::DispatchLock;
pub use error::{FetchError, FetchResult, TransportError};
pub use fulfiller::{Fulfiller, StepOutcome, TransferMeter, TransferStrategy};
pub use orchestrator::{
    AbortReason, DownloadEvent, Downloader, FailedTarget, FailureReason, RunOutcome, RunSnapshot,
    RunStatus, TargetSnapshot, TargetStatus,
};
pub use target::Target;
pub use transport::{HttpTransport, MemoryResource, MemoryTransport, Transport};
