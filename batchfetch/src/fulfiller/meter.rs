//! Byte and timing counters for one transfer.
//!
//! The meter is shared (`Arc`) between the fulfiller, which moves into an
//! in-flight task while a request runs, and the orchestrator, which answers
//! progress queries at any time. Counters are atomics so neither side has to
//! lock the other out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Elapsed times below this are treated as "no time has passed".
pub const MIN_THROUGHPUT_ELAPSED: Duration = Duration::from_millis(1);

/// Marker for "size not known yet".
const UNKNOWN_SIZE: u64 = u64::MAX;

/// Bytes per second for `bytes` transferred over `elapsed`.
///
/// Returns 0.0 when `elapsed` is below [`MIN_THROUGHPUT_ELAPSED`].
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed < MIN_THROUGHPUT_ELAPSED {
        return 0.0;
    }
    bytes as f64 / elapsed.as_secs_f64()
}

#[derive(Debug, Default, Clone, Copy)]
struct Timing {
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// Shared progress counters for a single target.
#[derive(Debug)]
pub struct TransferMeter {
    bytes_downloaded: AtomicU64,
    expected_size: AtomicU64,
    completed: AtomicBool,
    failed: AtomicBool,
    timing: Mutex<Timing>,
}

impl Default for TransferMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMeter {
    /// Create a meter with nothing recorded.
    pub fn new() -> Self {
        Self {
            bytes_downloaded: AtomicU64::new(0),
            expected_size: AtomicU64::new(UNKNOWN_SIZE),
            completed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            timing: Mutex::new(Timing::default()),
        }
    }

    /// Bytes on disk for this target as of the last completed request.
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::SeqCst)
    }

    /// Size announced by the probe, if any.
    pub fn expected_size(&self) -> Option<u64> {
        match self.expected_size.load(Ordering::SeqCst) {
            UNKNOWN_SIZE => None,
            size => Some(size),
        }
    }

    /// True once the transfer finished successfully.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// True if the last attempt failed.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// True once the first request was issued.
    pub fn is_started(&self) -> bool {
        self.timing.lock().started.is_some()
    }

    /// Progress in `[0, 1]`.
    ///
    /// Complete transfers report 1.0. Otherwise progress is bytes over the
    /// expected size, or 0.0 while the size is unknown.
    pub fn progress(&self) -> f64 {
        if self.is_complete() {
            return 1.0;
        }
        match self.expected_size() {
            Some(0) | None => 0.0,
            Some(expected) => (self.bytes_downloaded() as f64 / expected as f64).min(1.0),
        }
    }

    /// Time from first request to completion, or to now while running.
    pub fn elapsed(&self) -> Duration {
        let timing = *self.timing.lock();
        match (timing.started, timing.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Bytes per second over [`elapsed`](Self::elapsed).
    pub fn throughput(&self) -> f64 {
        throughput(self.bytes_downloaded(), self.elapsed())
    }

    pub(crate) fn set_expected_size(&self, size: u64) {
        self.expected_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn set_bytes_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.store(bytes, Ordering::SeqCst);
    }

    /// Stamp the start time if this is the first request.
    pub(crate) fn mark_started(&self) {
        let mut timing = self.timing.lock();
        if timing.started.is_none() {
            timing.started = Some(Instant::now());
        }
        timing.finished = None;
    }

    pub(crate) fn mark_complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        self.timing.lock().finished = Some(Instant::now());
    }

    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.timing.lock().finished = Some(Instant::now());
    }

    /// Clear the failure flag so the target can be attempted again.
    pub(crate) fn clear_failure(&self) {
        self.failed.store(false, Ordering::SeqCst);
    }

    /// Forget a completed transfer whose file has to be fetched again.
    ///
    /// The expected size is kept; the first request of the next attempt
    /// sets the byte count from the file on disk.
    pub(crate) fn clear_completion(&self) {
        self.completed.store(false, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
        self.bytes_downloaded.store(0, Ordering::SeqCst);
        self.timing.lock().finished = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_new() {
        let meter = TransferMeter::new();
        assert_eq!(meter.bytes_downloaded(), 0);
        assert_eq!(meter.expected_size(), None);
        assert_eq!(meter.progress(), 0.0);
        assert_eq!(meter.elapsed(), Duration::ZERO);
        assert_eq!(meter.throughput(), 0.0);
        assert!(!meter.is_started());
    }

    #[test]
    fn test_progress_by_bytes() {
        let meter = TransferMeter::new();
        meter.set_expected_size(1000);
        meter.set_bytes_downloaded(250);
        assert_eq!(meter.progress(), 0.25);

        meter.mark_complete();
        assert_eq!(meter.progress(), 1.0);
    }

    #[test]
    fn test_progress_clamped() {
        let meter = TransferMeter::new();
        meter.set_expected_size(100);
        meter.set_bytes_downloaded(150);
        assert_eq!(meter.progress(), 1.0);
    }

    #[test]
    fn test_elapsed_frozen_after_completion() {
        let meter = TransferMeter::new();
        meter.mark_started();
        std::thread::sleep(Duration::from_millis(5));
        meter.mark_complete();

        let first = meter.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(meter.elapsed(), first);
        assert!(first >= Duration::from_millis(5));
    }

    #[test]
    fn test_throughput_near_zero_elapsed() {
        assert_eq!(throughput(1_000_000, Duration::ZERO), 0.0);
        assert_eq!(throughput(1_000_000, Duration::from_micros(500)), 0.0);
    }

    #[test]
    fn test_throughput_sub_second() {
        let rate = throughput(500, Duration::from_millis(250));
        assert!((rate - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear_completion() {
        let meter = TransferMeter::new();
        meter.set_expected_size(100);
        meter.set_bytes_downloaded(100);
        meter.mark_started();
        meter.mark_complete();
        assert_eq!(meter.progress(), 1.0);

        meter.clear_completion();
        assert!(!meter.is_complete());
        assert_eq!(meter.bytes_downloaded(), 0);
        assert_eq!(meter.progress(), 0.0);
        assert_eq!(meter.expected_size(), Some(100));
    }

    #[test]
    fn test_failure_then_retry() {
        let meter = TransferMeter::new();
        meter.mark_started();
        meter.mark_failed();
        assert!(meter.is_failed());

        meter.clear_failure();
        assert!(!meter.is_failed());
    }
}
