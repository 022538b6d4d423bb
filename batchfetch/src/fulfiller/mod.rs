//! Per-target transfer state machine.
//!
//! A [`Fulfiller`] owns everything needed to bring one target to disk:
//!
//! ```text
//! Unprobed ──probe──► SingleShot ──GET──────────────────► Complete
//!     │                                                     ▲
//!     └──────probe──► Chunked ──ranged GET──► (more?) ──no──┘
//!                        ▲                      │
//!                        └──────────yes─────────┘
//! any transport error ──────────────────────────────────► Failed
//! ```
//!
//! Each call to [`Fulfiller::advance`] performs exactly one transport
//! request. The orchestrator decides what happens next; the fulfiller never
//! loops on its own.

mod checksum;
mod meter;
mod strategy;

pub use checksum::{file_sha256, verify_sha256};
pub use meter::{throughput, TransferMeter, MIN_THROUGHPUT_ELAPSED};
pub use strategy::{next_range, ProbeOutcome, TransferStrategy};

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::target::Target;
use crate::transport::{Transport, TransportRequest};

/// Where a fulfiller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillerPhase {
    /// Strategy not decided yet.
    Unprobed,
    /// Fetching the whole body in one request.
    SingleShot,
    /// Fetching sequential byte ranges.
    Chunked,
    /// File fully on disk.
    Complete,
    /// Last request failed.
    Failed,
}

/// Result of one [`Fulfiller::advance`] step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// A chunk landed but more remain.
    Progressed { progress: f64 },
    /// The target is complete.
    Finished,
    /// The step failed; the fulfiller is now in [`FulfillerPhase::Failed`].
    Failed(TransportError),
}

/// Transfer state machine for one target.
#[derive(Debug)]
pub struct Fulfiller {
    target: Arc<Target>,
    chunk_size: u64,
    probe: Option<ProbeOutcome>,
    strategy: Option<TransferStrategy>,
    phase: FulfillerPhase,
    error: Option<TransportError>,
    meter: Arc<TransferMeter>,
}

impl Fulfiller {
    /// Create a fulfiller for `target` using `chunk_size` for ranged steps.
    pub fn new(target: Arc<Target>, chunk_size: u64) -> Self {
        Self {
            target,
            chunk_size,
            probe: None,
            strategy: None,
            phase: FulfillerPhase::Unprobed,
            error: None,
            meter: Arc::new(TransferMeter::new()),
        }
    }

    /// The target being fetched.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Resource URI.
    pub fn uri(&self) -> &str {
        &self.target.uri
    }

    /// Destination path.
    pub fn destination(&self) -> &Path {
        &self.target.destination
    }

    /// Shared counters; stay valid while the fulfiller is in flight.
    pub fn meter(&self) -> Arc<TransferMeter> {
        Arc::clone(&self.meter)
    }

    /// Current phase.
    pub fn phase(&self) -> FulfillerPhase {
        self.phase
    }

    /// Cached probe result, if a probe ran.
    pub fn probe_outcome(&self) -> Option<&ProbeOutcome> {
        self.probe.as_ref()
    }

    /// Resolved strategy; `None` until the first step.
    pub fn strategy(&self) -> Option<TransferStrategy> {
        self.strategy
    }

    /// True when the resolved strategy is chunked.
    pub fn is_chunked(&self) -> bool {
        self.strategy.is_some_and(|s| s.is_chunked())
    }

    /// True once the file is complete.
    pub fn is_complete(&self) -> bool {
        self.phase == FulfillerPhase::Complete
    }

    /// The error from the failing step, if any.
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// Decide the transfer strategy.
    ///
    /// Issues a HEAD only when chunked transfer is enabled for the target.
    /// Any probe failure falls back to single-shot; the result is cached and
    /// never re-probed.
    pub async fn probe<T: Transport + ?Sized>(&mut self, transport: &T) -> TransferStrategy {
        if let Some(strategy) = self.strategy {
            return strategy;
        }

        let outcome = if self.target.try_chunked_transfer {
            let request = self.request();
            match transport.head(&request).await {
                Ok(response) => ProbeOutcome::from_head(&response),
                Err(e) => {
                    debug!(
                        uri = %self.target.uri,
                        error = %e,
                        "HEAD probe failed, using single-shot"
                    );
                    ProbeOutcome::Unsupported
                }
            }
        } else {
            ProbeOutcome::Skipped
        };

        if let ProbeOutcome::RangeCapable { content_length } = outcome {
            self.meter.set_expected_size(content_length);
        } else if outcome == ProbeOutcome::Unsupported {
            debug!(uri = %self.target.uri, "server does not support ranged transfer");
        }

        let strategy = TransferStrategy::select(&outcome, self.chunk_size);
        debug!(uri = %self.target.uri, ?strategy, "transfer strategy resolved");

        self.probe = Some(outcome);
        self.strategy = Some(strategy);
        self.phase = if strategy.is_chunked() {
            FulfillerPhase::Chunked
        } else {
            FulfillerPhase::SingleShot
        };
        strategy
    }

    /// Perform the next step: probe if needed, then one transport request.
    ///
    /// Complete and failed fulfillers return immediately without touching
    /// the transport; call [`reset_for_retry`](Self::reset_for_retry) first
    /// to try a failed target again.
    pub async fn advance<T: Transport + ?Sized>(&mut self, transport: &T) -> StepOutcome {
        match (self.phase, &self.error) {
            (FulfillerPhase::Complete, _) => return StepOutcome::Finished,
            (FulfillerPhase::Failed, Some(err)) => return StepOutcome::Failed(err.clone()),
            _ => {}
        }

        self.meter.mark_started();
        let strategy = self.probe(transport).await;
        self.transfer_next(transport, strategy).await
    }

    async fn transfer_next<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        strategy: TransferStrategy,
    ) -> StepOutcome {
        let result = match strategy {
            TransferStrategy::SingleShot => self.transfer_whole(transport).await,
            TransferStrategy::Chunked {
                expected_size,
                chunk_size,
            } => {
                self.transfer_chunk(transport, expected_size, chunk_size)
                    .await
            }
        };

        match result {
            Ok(false) => StepOutcome::Progressed {
                progress: self.meter.progress(),
            },
            Ok(true) => match self.finish().await {
                Ok(()) => StepOutcome::Finished,
                Err(e) => self.fail(e),
            },
            Err(e) => self.fail(e),
        }
    }

    async fn transfer_whole<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
    ) -> Result<bool, TransportError> {
        let request = self.request();
        transport
            .get_range(&request, &self.target.destination, false)
            .await?;

        let written = file_size(&self.target.destination).await?;
        self.meter.set_bytes_downloaded(written);
        Ok(true)
    }

    /// Request the next range. Returns `true` when the file is complete.
    async fn transfer_chunk<T: Transport + ?Sized>(
        &mut self,
        transport: &T,
        expected_size: u64,
        chunk_size: u64,
    ) -> Result<bool, TransportError> {
        let dest = &self.target.destination;
        let current = file_size(dest).await?;
        if current > expected_size {
            return Err(TransportError::SizeMismatch {
                path: dest.clone(),
                expected: expected_size,
                actual: current,
            });
        }

        let Some(range) = next_range(expected_size, chunk_size, current) else {
            self.meter.set_bytes_downloaded(current);
            return Ok(true);
        };

        let request = self.request().with_range(range);
        transport.get_range(&request, dest, true).await?;

        let now = file_size(dest).await?;
        let wanted = current + range.len();
        if now != wanted {
            return Err(TransportError::SizeMismatch {
                path: dest.clone(),
                expected: wanted,
                actual: now,
            });
        }

        self.meter.set_bytes_downloaded(now);
        debug!(
            uri = %self.target.uri,
            range = %range,
            bytes = now,
            expected = expected_size,
            "chunk received"
        );
        Ok(now == expected_size)
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        if let Some(expected) = &self.target.sha256 {
            verify_sha256(&self.target.destination, expected).await?;
        }
        self.phase = FulfillerPhase::Complete;
        self.error = None;
        self.meter.mark_complete();
        Ok(())
    }

    fn fail(&mut self, error: TransportError) -> StepOutcome {
        debug!(uri = %self.target.uri, error = %error, "transfer step failed");
        self.phase = FulfillerPhase::Failed;
        self.error = Some(error.clone());
        self.meter.mark_failed();
        StepOutcome::Failed(error)
    }

    /// Delete the destination file. Returns true if a file was removed.
    ///
    /// Best effort: failures other than "not found" are logged.
    pub async fn rollback(&self) -> bool {
        remove_file(&self.target.destination).await
    }

    /// Clear the failure so the target can be dispatched again.
    ///
    /// The cached probe and any partial file are kept; a chunked transfer
    /// resumes from the current file size. A completed fulfiller also
    /// drops its completion, since its file may have been rolled back.
    pub fn reset_for_retry(&mut self) {
        if self.phase == FulfillerPhase::Complete {
            self.meter.clear_completion();
        } else {
            self.meter.clear_failure();
        }
        self.error = None;
        self.phase = match self.strategy {
            None => FulfillerPhase::Unprobed,
            Some(s) if s.is_chunked() => FulfillerPhase::Chunked,
            Some(_) => FulfillerPhase::SingleShot,
        };
    }

    fn request(&self) -> TransportRequest {
        TransportRequest::new(
            self.target.uri.clone(),
            self.target.headers.clone(),
            self.target.timeout,
        )
    }
}

/// Size of `path`, or 0 if it does not exist.
async fn file_size(path: &Path) -> Result<u64, TransportError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(TransportError::io(path, &e)),
    }
}

/// Remove `path`, ignoring "not found". Returns true if a file was removed.
pub(crate) async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove file");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DownloaderConfig, TargetOptions};
    use crate::transport::{MemoryResource, MemoryTransport};
    use std::time::Duration;

    const URI: &str = "http://mem/data.bin";

    fn target(dir: &Path, options: TargetOptions) -> Arc<Target> {
        let config = DownloaderConfig::new(dir)
            .with_timeout(Duration::from_secs(2))
            .with_filename(URI, "data.bin");
        Arc::new(Target::resolve(URI, options, &config).unwrap())
    }

    fn fulfiller(dir: &Path, chunk_size: u64) -> Fulfiller {
        Fulfiller::new(target(dir, TargetOptions::default()), chunk_size)
    }

    #[tokio::test]
    async fn test_small_resource_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(50));
        let mut fulfiller = fulfiller(dir.path(), 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert!(fulfiller.is_complete());
        assert!(!fulfiller.is_chunked());
        assert_eq!(fulfiller.meter().bytes_downloaded(), 50);
        assert_eq!(fulfiller.meter().progress(), 1.0);

        let methods: Vec<_> = transport.requests().iter().map(|r| r.method).collect();
        assert_eq!(methods, vec!["HEAD", "GET"]);
    }

    #[tokio::test]
    async fn test_large_resource_chunked_steps() {
        let dir = tempfile::tempdir().unwrap();
        let resource = MemoryResource::sized(250);
        let body = resource.body.clone();
        let transport = MemoryTransport::new().with_resource(URI, resource);
        let mut fulfiller = fulfiller(dir.path(), 100);

        match fulfiller.advance(&transport).await {
            StepOutcome::Progressed { progress } => assert!((progress - 0.4).abs() < 1e-9),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fulfiller.is_chunked());
        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Progressed { .. }
        ));
        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));

        let ranges: Vec<_> = transport
            .requests()
            .into_iter()
            .filter_map(|r| r.range)
            .map(|r| r.header_value())
            .collect();
        assert_eq!(ranges, vec!["bytes=0-99", "bytes=100-199", "bytes=200-249"]);
        assert_eq!(
            std::fs::read(dir.path().join("data.bin")).unwrap(),
            body.to_vec()
        );
    }

    #[tokio::test]
    async fn test_probe_not_repeated() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(300));
        let mut fulfiller = fulfiller(dir.path(), 100);

        while !matches!(fulfiller.advance(&transport).await, StepOutcome::Finished) {}

        let heads = transport
            .requests()
            .iter()
            .filter(|r| r.method == "HEAD")
            .count();
        assert_eq!(heads, 1);
    }

    #[tokio::test]
    async fn test_head_failure_falls_back_to_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(500).without_head());
        let mut fulfiller = fulfiller(dir.path(), 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert_eq!(fulfiller.strategy(), Some(TransferStrategy::SingleShot));
        assert_eq!(fulfiller.probe_outcome(), Some(&ProbeOutcome::Unsupported));
        assert_eq!(fulfiller.meter().bytes_downloaded(), 500);
    }

    #[tokio::test]
    async fn test_no_accept_ranges_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(500).without_ranges());
        let mut fulfiller = fulfiller(dir.path(), 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert!(transport.requests().iter().all(|r| r.range.is_none()));
    }

    #[tokio::test]
    async fn test_probe_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(500));
        let target = target(
            dir.path(),
            TargetOptions::default().with_chunked_transfer(false),
        );
        let mut fulfiller = Fulfiller::new(target, 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert_eq!(fulfiller.probe_outcome(), Some(&ProbeOutcome::Skipped));
        let methods: Vec<_> = transport.requests().iter().map(|r| r.method).collect();
        assert_eq!(methods, vec!["GET"]);
    }

    #[tokio::test]
    async fn test_resume_from_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let resource = MemoryResource::sized(250);
        let body = resource.body.clone();
        std::fs::write(dir.path().join("data.bin"), &body[..120]).unwrap();
        let transport = MemoryTransport::new().with_resource(URI, resource);
        let mut fulfiller = fulfiller(dir.path(), 200);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert_eq!(
            std::fs::read(dir.path().join("data.bin")).unwrap(),
            body.to_vec()
        );
        let gets = transport.requests_for(URI);
        assert_eq!(
            gets.last().and_then(|r| r.range).map(|r| r.header_value()),
            Some("bytes=120-249".to_string())
        );
    }

    #[tokio::test]
    async fn test_oversized_partial_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), vec![0u8; 400]).unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(250));
        let mut fulfiller = fulfiller(dir.path(), 100);

        match fulfiller.advance(&transport).await {
            StepOutcome::Failed(TransportError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 250);
                assert_eq!(actual, 400);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(fulfiller.phase(), FulfillerPhase::Failed);
    }

    #[tokio::test]
    async fn test_chunk_failure_then_retry_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(250).fail_on_get(2));
        let mut fulfiller = fulfiller(dir.path(), 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Progressed { .. }
        ));
        let err = match fulfiller.advance(&transport).await {
            StepOutcome::Failed(e) => e,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(err.code(), 500);
        assert!(fulfiller.meter().is_failed());

        // A failed fulfiller does not issue requests until reset.
        let before = transport.requests().len();
        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Failed(_)
        ));
        assert_eq!(transport.requests().len(), before);

        fulfiller.reset_for_retry();
        assert_eq!(fulfiller.phase(), FulfillerPhase::Chunked);
        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Progressed { .. }
        ));
        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
        assert_eq!(fulfiller.meter().bytes_downloaded(), 250);
    }

    #[tokio::test]
    async fn test_reset_after_rollback_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(150));
        let mut fulfiller = fulfiller(dir.path(), 100);

        while !matches!(fulfiller.advance(&transport).await, StepOutcome::Finished) {}
        assert_eq!(fulfiller.meter().progress(), 1.0);

        assert!(fulfiller.rollback().await);
        fulfiller.reset_for_retry();

        assert_eq!(fulfiller.phase(), FulfillerPhase::Chunked);
        assert!(!fulfiller.meter().is_complete());
        assert_eq!(fulfiller.meter().bytes_downloaded(), 0);
        assert_eq!(fulfiller.meter().progress(), 0.0);

        while !matches!(fulfiller.advance(&transport).await, StepOutcome::Finished) {}
        assert_eq!(
            std::fs::metadata(dir.path().join("data.bin")).unwrap().len(),
            150
        );
        assert_eq!(fulfiller.meter().progress(), 1.0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::new("hello world"));
        let target = target(dir.path(), TargetOptions::default().with_sha256("00ff"));
        let mut fulfiller = Fulfiller::new(target, 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Failed(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_checksum_match_completes() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::new("hello world"));
        let target = target(
            dir.path(),
            TargetOptions::default()
                .with_sha256("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"),
        );
        let mut fulfiller = Fulfiller::new(target, 100);

        assert!(matches!(
            fulfiller.advance(&transport).await,
            StepOutcome::Finished
        ));
    }

    #[tokio::test]
    async fn test_rollback_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(250));
        let mut fulfiller = fulfiller(dir.path(), 100);

        fulfiller.advance(&transport).await;
        assert!(dir.path().join("data.bin").exists());

        assert!(fulfiller.rollback().await);
        assert!(!dir.path().join("data.bin").exists());
        assert!(!fulfiller.rollback().await);
    }

    #[tokio::test]
    async fn test_missing_resource_fails_with_status() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let mut fulfiller = fulfiller(dir.path(), 100);

        match fulfiller.advance(&transport).await {
            StepOutcome::Failed(e) => assert_eq!(e.code(), 404),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(fulfiller.error().is_some());
    }
}
