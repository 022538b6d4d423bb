//! Bounded-concurrency download orchestration.
//!
//! The [`Downloader`] owns one [`Fulfiller`] per registered target and keeps
//! every target in exactly one of four sets: pending, active, completed or
//! failed.
//!
//! # Flow
//!
//! ```text
//! start() ──► dispatch min(max_concurrency, pending) steps
//!                       │
//!        step task: fulfiller.advance(transport)
//!                       │
//!        completion handler (under the dispatch lock)
//!          ├─ chunk landed, more to go ──► same fulfiller, next step
//!          ├─ finished ──► completed, refill slot from pending
//!          ├─ failed ──► failed; continue or abort per policy
//!          └─ nothing pending or active ──► RunSucceeded
//! ```
//!
//! Each step runs as its own tokio task. A step that returns after its run
//! was cancelled or superseded is rolled back and otherwise ignored.
//!
//! # Failure policy
//!
//! | abandon_on_failure | continue_after_failure | first failure |
//! |---|---|---|
//! | true | ignored | abort, delete completed and partial files |
//! | false | false | abort, keep files |
//! | false | true | mark failed, keep going |

mod events;
mod ledger;
mod snapshot;

pub use events::{AbortReason, DownloadEvent, EventBus, EventListener};
pub use ledger::{FailureReason, RunStatus, TargetStatus};
pub use snapshot::{FailedTarget, RunOutcome, RunSnapshot, TargetSnapshot};

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{DownloaderConfig, TargetOptions};
use crate::dispatch_lock::DispatchLock;
use crate::error::{FetchError, FetchResult, TransportError};
use crate::fulfiller::{remove_file, throughput, Fulfiller, StepOutcome, MIN_THROUGHPUT_ELAPSED};
use crate::target::Target;
use crate::transport::Transport;

use ledger::{Ledger, RunScope};

/// Poll interval while waiting for transport headroom.
const HEADROOM_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Polls before dispatching anyway.
const HEADROOM_MAX_POLLS: u32 = 40;

/// Concurrent multi-file downloader.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```no_run
/// use batchfetch::{Downloader, DownloaderConfig, HttpTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = DownloaderConfig::new("downloads")
///     .with_max_concurrency(2)
///     .with_filename("https://example.com/a.bin", "a.bin");
/// let downloader = Downloader::new(config, HttpTransport::new()?)?;
///
/// downloader.add_target("https://example.com/a.bin")?;
/// let outcome = downloader.run().await?;
/// println!("{} completed", outcome.completed.len());
/// # Ok(())
/// # }
/// ```
pub struct Downloader<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Downloader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Downloader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ledger = self.inner.ledger.lock();
        f.debug_struct("Downloader")
            .field("status", &ledger.run_status())
            .field("targets", &ledger.len())
            .field("in_flight", &self.inner.activity.transfers())
            .finish()
    }
}

struct Inner<T> {
    config: DownloaderConfig,
    transport: T,
    lock: DispatchLock,
    ledger: Mutex<Ledger>,
    events: EventBus,
    activity: Arc<Activity>,
    status: watch::Sender<RunStatus>,
}

/// Counts of in-flight work.
struct Activity {
    /// Transport steps currently awaiting the transport.
    transfers: AtomicUsize,
    /// Step tasks alive, including their completion handling.
    tasks: watch::Sender<usize>,
}

impl Activity {
    fn new() -> Self {
        let (tasks, _) = watch::channel(0);
        Self {
            transfers: AtomicUsize::new(0),
            tasks,
        }
    }

    fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    fn enter_task(self: &Arc<Self>) -> TaskGuard {
        self.tasks.send_modify(|n| *n += 1);
        self.transfers.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            activity: Arc::clone(self),
            transfer_open: true,
        }
    }
}

/// Tracks one step task; releases its counts on drop.
struct TaskGuard {
    activity: Arc<Activity>,
    transfer_open: bool,
}

impl TaskGuard {
    /// The transport part of the step is over.
    fn end_transfer(&mut self) {
        if std::mem::take(&mut self.transfer_open) {
            self.activity.transfers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.end_transfer();
        self.activity.tasks.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// What the completion handler does with a returned step.
enum Disposition {
    /// The run that issued the step is over.
    Stale,
    /// `cancel_one` was requested while the step was in flight.
    Cancelled,
    /// A chunk landed; schedule the next one.
    Continue { progress: f64 },
    Succeeded,
    Failed(TransportError),
}

impl<T: Transport> Downloader<T> {
    /// Create a downloader.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` fails validation.
    pub fn new(config: DownloaderConfig, transport: T) -> FetchResult<Self> {
        config.validate()?;
        let (status, _) = watch::channel(RunStatus::Idle);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                transport,
                lock: DispatchLock::new(),
                ledger: Mutex::new(Ledger::new()),
                events: EventBus::new(),
                activity: Arc::new(Activity::new()),
                status,
            }),
        })
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Register a listener for [`DownloadEvent`]s.
    ///
    /// Listeners are called in registration order on the task that produced
    /// the event and must not block.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener);
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Queue a target using the downloader-wide settings.
    pub fn add_target(&self, uri: &str) -> FetchResult<()> {
        self.add_target_with(uri, TargetOptions::default())
    }

    /// Queue a target with per-target overrides.
    ///
    /// # Errors
    ///
    /// - configuration errors from resolving the target
    /// - [`FetchError::DuplicateTarget`] if the URI is already registered
    /// - [`FetchError::DuplicateDestination`] if another target already
    ///   writes to the same path
    /// - [`FetchError::RunActive`] while a run is active (use
    ///   [`start_one_with`](Self::start_one_with) instead)
    /// - [`FetchError::ResetRequired`] after a finished run
    pub fn add_target_with(&self, uri: &str, options: TargetOptions) -> FetchResult<()> {
        let target = Target::resolve(uri, options, &self.inner.config)?;
        let mut ledger = self.inner.ledger.lock();
        match ledger.run_status() {
            RunStatus::Running => return Err(FetchError::RunActive),
            RunStatus::Succeeded | RunStatus::Aborted => return Err(FetchError::ResetRequired),
            RunStatus::Idle => {}
        }
        if ledger.contains(uri) {
            return Err(FetchError::DuplicateTarget {
                uri: uri.to_string(),
            });
        }
        claim_destination(&ledger, &target)?;
        ledger.register(Arc::new(target), self.inner.config.chunk_size_bytes);
        debug!(uri, "target registered");
        Ok(())
    }

    /// Queue several targets. Stops at the first error.
    pub fn add_targets<I, S>(&self, uris: I) -> FetchResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for uri in uris {
            self.add_target(uri.as_ref())?;
        }
        Ok(())
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Start a run over every pending target.
    ///
    /// Dispatches up to `max_concurrency` targets before returning. Use
    /// [`wait`](Self::wait) to await the end of the run.
    ///
    /// # Errors
    ///
    /// - [`FetchError::AlreadyRunning`] if a run is active
    /// - [`FetchError::ResetRequired`] if a finished run was not reset
    /// - [`FetchError::NothingPending`] if no target is queued
    pub async fn start(&self) -> FetchResult<()> {
        let _guard = self.inner.lock.acquire().await;
        {
            let ledger = self.inner.ledger.lock();
            match ledger.run_status() {
                RunStatus::Running => return Err(FetchError::AlreadyRunning),
                RunStatus::Succeeded | RunStatus::Aborted => {
                    return Err(FetchError::ResetRequired)
                }
                RunStatus::Idle => {}
            }
            if ledger.pending_len() == 0 {
                return Err(FetchError::NothingPending);
            }
        }

        self.inner.begin_run().await
    }

    /// Start and wait for a run.
    pub async fn run(&self) -> FetchResult<RunOutcome> {
        self.start().await?;
        Ok(self.wait().await)
    }

    /// Download a single URI, registering it if needed.
    pub async fn start_one(&self, uri: &str) -> FetchResult<()> {
        self.start_one_with(uri, TargetOptions::default()).await
    }

    /// Download a single URI with per-target overrides.
    ///
    /// - unknown: registered and queued (`options` apply)
    /// - pending or completed: nothing to do
    /// - active: clears a pending [`cancel_one`](Self::cancel_one) request
    /// - failed: queued again, resuming from any partial file
    ///
    /// A target queued while a run is active joins that run. The run's
    /// [`progress`](Self::progress) holds its current value until
    /// completions catch up with the larger total.
    ///
    /// With no run active, a new run starts over everything pending; the
    /// completed and failed sets of earlier runs are kept.
    pub async fn start_one_with(&self, uri: &str, options: TargetOptions) -> FetchResult<()> {
        let _guard = self.inner.lock.acquire().await;

        let running = {
            let mut ledger = self.inner.ledger.lock();
            let queued = match ledger.status(uri).cloned() {
                None => {
                    let target = Target::resolve(uri, options, &self.inner.config)?;
                    claim_destination(&ledger, &target)?;
                    ledger.register(Arc::new(target), self.inner.config.chunk_size_bytes);
                    debug!(uri, "target registered");
                    true
                }
                Some(TargetStatus::Failed(_)) => {
                    debug!(uri, "re-queueing failed target");
                    ledger.requeue(uri)
                }
                Some(TargetStatus::Active) => {
                    if let Some(entry) = ledger.entry_mut(uri) {
                        entry.cancel_requested = false;
                    }
                    false
                }
                Some(TargetStatus::Pending) | Some(TargetStatus::Completed) => false,
            };

            if queued {
                ledger.join_run(uri);
            }
            let running = ledger.running_scope().cloned();
            if running.is_none() && ledger.pending_len() == 0 {
                return Ok(());
            }
            running
        };

        match running {
            Some(scope) => {
                let events = self.inner.fill_slots(&scope).await;
                self.inner.flush(&events);
                Ok(())
            }
            None => self.inner.begin_run().await,
        }
    }

    /// Cancel the active run.
    ///
    /// In-flight steps see the cancellation as soon as they return. Pending
    /// and active targets move to the failed set; with `abandon_on_failure`
    /// every file this downloader wrote is deleted. Does nothing when no
    /// run is active.
    pub async fn cancel_all(&self) {
        if let Some(scope) = self.inner.ledger.lock().running_scope() {
            scope.token.cancel();
        }

        let _guard = self.inner.lock.acquire().await;
        let scope = self.inner.ledger.lock().running_scope().cloned();
        let Some(scope) = scope else {
            debug!("cancel_all with no active run");
            return;
        };

        info!(run = scope.id, "cancelling run");
        let events = self
            .inner
            .abort_run(&scope, AbortReason::Cancelled, FailureReason::Cancelled)
            .await;
        self.inner.flush(&events);
    }

    /// Cancel one target.
    ///
    /// A pending target moves to the failed set at once; an active one when
    /// its in-flight step returns. Either way its partial file is deleted.
    /// Cancelling a completed or failed target does nothing.
    ///
    /// # Errors
    ///
    /// [`FetchError::NotFound`] if the URI was never registered.
    pub async fn cancel_one(&self, uri: &str) -> FetchResult<()> {
        let _guard = self.inner.lock.acquire().await;

        let (status, path, scope) = {
            let ledger = self.inner.ledger.lock();
            let entry = ledger.entry(uri).ok_or_else(|| FetchError::NotFound {
                uri: uri.to_string(),
            })?;
            (
                entry.status.clone(),
                entry.target.destination.clone(),
                ledger.running_scope().cloned(),
            )
        };

        match status {
            TargetStatus::Pending => {
                self.inner
                    .ledger
                    .lock()
                    .mark_failed(uri, FailureReason::Cancelled);
                remove_file(&path).await;
                info!(uri, "pending target cancelled");

                let mut events = vec![DownloadEvent::TargetCancelled {
                    uri: uri.to_string(),
                }];
                if let Some(scope) = scope {
                    events.extend(self.inner.fill_slots(&scope).await);
                }
                self.inner.flush(&events);
            }
            TargetStatus::Active => {
                if let Some(entry) = self.inner.ledger.lock().entry_mut(uri) {
                    entry.cancel_requested = true;
                }
                debug!(uri, "cancellation requested for active target");
            }
            TargetStatus::Completed | TargetStatus::Failed(_) => {
                warn!(uri, "cancel_one on a target that already finished");
            }
        }
        Ok(())
    }

    /// Forget every target and the run metadata.
    ///
    /// Waits for steps of cancelled runs to drain first. Configuration and
    /// listeners are kept.
    ///
    /// # Errors
    ///
    /// [`FetchError::RunActive`] while a run is active.
    pub async fn reset(&self) -> FetchResult<()> {
        if self.is_running() {
            return Err(FetchError::RunActive);
        }
        self.wait_idle().await;

        let _guard = self.inner.lock.acquire().await;
        {
            let mut ledger = self.inner.ledger.lock();
            if ledger.is_running() {
                return Err(FetchError::RunActive);
            }
            ledger.clear();
        }
        self.inner.flush(&[]);
        info!("downloader reset");
        Ok(())
    }

    /// Wait until the current run is no longer running.
    ///
    /// Returns immediately when no run is active.
    pub async fn wait(&self) -> RunOutcome {
        let mut status = self.inner.status.subscribe();
        // The sender lives as long as `self`.
        let _ = status.wait_for(|s| !s.is_running()).await;
        self.outcome()
    }

    /// Wait until no step task is alive, including steps of cancelled runs.
    pub async fn wait_idle(&self) {
        let mut tasks = self.inner.activity.tasks.subscribe();
        let _ = tasks.wait_for(|n| *n == 0).await;
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn status(&self) -> RunStatus {
        self.inner.ledger.lock().run_status()
    }

    pub fn is_running(&self) -> bool {
        self.inner.ledger.lock().is_running()
    }

    /// Completed share of the current run's targets, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.inner
            .ledger
            .lock()
            .run
            .as_ref()
            .map_or(0.0, |run| run.progress())
    }

    /// Mean per-target progress, counting partial chunked transfers.
    pub fn detailed_progress(&self) -> f64 {
        let ledger = self.inner.ledger.lock();
        if ledger.len() == 0 {
            return 0.0;
        }
        let sum: f64 = ledger.entries().map(|e| e.meter.progress()).sum();
        sum / ledger.len() as f64
    }

    /// Progress of one target.
    pub fn target_progress(&self, uri: &str) -> Option<f64> {
        self.inner
            .ledger
            .lock()
            .entry(uri)
            .map(|e| e.meter.progress())
    }

    /// Which set a target is in.
    pub fn target_status(&self, uri: &str) -> Option<TargetStatus> {
        self.inner.ledger.lock().status(uri).cloned()
    }

    /// Destination path of a target.
    pub fn target_path(&self, uri: &str) -> Option<PathBuf> {
        self.inner
            .ledger
            .lock()
            .entry(uri)
            .map(|e| e.target.destination.clone())
    }

    /// Bytes on disk across every target.
    pub fn bytes_downloaded(&self) -> u64 {
        self.inner
            .ledger
            .lock()
            .entries()
            .map(|e| e.meter.bytes_downloaded())
            .sum()
    }

    /// Time since the current run started, frozen once it finishes.
    pub fn elapsed(&self) -> Duration {
        self.inner
            .ledger
            .lock()
            .run
            .as_ref()
            .map_or(Duration::ZERO, |run| run.elapsed())
    }

    /// Aggregate bytes per second over the run.
    pub fn throughput(&self) -> f64 {
        throughput(self.bytes_downloaded(), self.elapsed())
    }

    /// Targets completed per second over the run.
    pub fn files_per_second(&self) -> f64 {
        let ledger = self.inner.ledger.lock();
        let Some(run) = ledger.run.as_ref() else {
            return 0.0;
        };
        let elapsed = run.elapsed();
        if elapsed < MIN_THROUGHPUT_ELAPSED {
            return 0.0;
        }
        run.completed_count as f64 / elapsed.as_secs_f64()
    }

    /// Transport steps currently in flight, including stale ones.
    pub fn in_flight(&self) -> usize {
        self.inner.activity.transfers()
    }

    pub fn pending(&self) -> Vec<String> {
        self.inner.ledger.lock().pending()
    }

    pub fn active(&self) -> Vec<String> {
        self.inner.ledger.lock().active().to_vec()
    }

    pub fn completed(&self) -> Vec<String> {
        self.inner.ledger.lock().completed().to_vec()
    }

    pub fn failed(&self) -> Vec<String> {
        self.inner.ledger.lock().failed().to_vec()
    }

    /// Failed targets with their reasons.
    pub fn failures(&self) -> Vec<FailedTarget> {
        self.inner
            .ledger
            .lock()
            .failures()
            .into_iter()
            .map(FailedTarget::from)
            .collect()
    }

    /// Capture every query at once.
    pub fn snapshot(&self) -> RunSnapshot {
        let bytes_downloaded = self.bytes_downloaded();
        let detailed_progress = self.detailed_progress();
        let files_per_second = self.files_per_second();

        let ledger = self.inner.ledger.lock();
        let run = ledger.run.as_ref();
        let elapsed = run.map_or(Duration::ZERO, |r| r.elapsed());
        let config = &self.inner.config;

        RunSnapshot {
            status: ledger.run_status(),
            started_at: run.map(|r| r.started_at),
            finished_at: run.and_then(|r| r.finished_at),
            elapsed_secs: elapsed.as_secs_f64(),
            progress: run.map_or(0.0, |r| r.progress()),
            detailed_progress,
            bytes_downloaded,
            bytes_per_second: throughput(bytes_downloaded, elapsed),
            files_per_second,
            max_concurrency: run.map_or(config.max_concurrency, |r| r.max_concurrency),
            abandon_on_failure: run.map_or(config.abandon_on_failure, |r| {
                r.scope.abandon_on_failure
            }),
            continue_after_failure: run.map_or(config.continue_after_failure, |r| {
                r.continue_after_failure
            }),
            pending: ledger.pending(),
            active: ledger.active().to_vec(),
            completed: ledger.completed().to_vec(),
            failed: ledger
                .failures()
                .into_iter()
                .map(FailedTarget::from)
                .collect(),
            targets: ledger
                .entries()
                .map(|e| TargetSnapshot {
                    uri: e.target.uri.clone(),
                    path: e.target.destination.clone(),
                    progress: e.meter.progress(),
                    bytes_downloaded: e.meter.bytes_downloaded(),
                    expected_size: e.meter.expected_size(),
                })
                .collect(),
        }
    }

    fn outcome(&self) -> RunOutcome {
        let ledger = self.inner.ledger.lock();
        RunOutcome {
            status: ledger.run_status(),
            completed: ledger.completed().to_vec(),
            failed: ledger
                .failures()
                .into_iter()
                .map(FailedTarget::from)
                .collect(),
            elapsed: ledger.run.as_ref().map_or(Duration::ZERO, |r| r.elapsed()),
        }
    }
}

impl<T: Transport> Inner<T> {
    /// Start a run over the pending queue. Caller holds the dispatch lock.
    async fn begin_run(self: &Arc<Self>) -> FetchResult<()> {
        let dir = &self.config.destination_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| FetchError::CreateDirFailed {
                path: dir.clone(),
                source,
            })?;

        let (scope, targets) = {
            let mut ledger = self.ledger.lock();
            let scope = ledger.begin_run(
                self.config.max_concurrency,
                self.config.abandon_on_failure,
                self.config.continue_after_failure,
            );
            let targets = ledger.pending_len();
            info!(
                run = scope.id,
                targets,
                max_concurrency = self.config.max_concurrency,
                "download run started"
            );
            (scope, targets)
        };
        self.flush(&[DownloadEvent::RunStarted {
            run_id: scope.id,
            targets,
        }]);

        let events = self.fill_slots(&scope).await;
        self.flush(&events);
        Ok(())
    }

    /// Dispatch pending targets into free slots, then end the run if
    /// nothing is left. Caller holds the dispatch lock.
    async fn fill_slots(self: &Arc<Self>, scope: &RunScope) -> Vec<DownloadEvent> {
        let max = self.config.max_concurrency;
        loop {
            {
                let ledger = self.ledger.lock();
                if !ledger.is_current(scope) {
                    return Vec::new();
                }
                if ledger.active().len() >= max || !ledger.has_dispatchable() {
                    break;
                }
            }

            self.await_headroom(max).await;

            let fulfiller = {
                let mut ledger = self.ledger.lock();
                if !ledger.is_current(scope) {
                    return Vec::new();
                }
                ledger.take_next()
            };
            match fulfiller {
                Some(fulfiller) => {
                    debug!(uri = fulfiller.uri(), run = scope.id, "dispatching target");
                    self.launch(scope.clone(), fulfiller);
                }
                None => break,
            }
        }

        self.finish_if_drained(scope).into_iter().collect()
    }

    /// Wait while stale transfers hold the transport at the bound.
    async fn await_headroom(&self, max: usize) {
        for _ in 0..HEADROOM_MAX_POLLS {
            if self.activity.transfers() < max {
                return;
            }
            tokio::time::sleep(HEADROOM_POLL_INTERVAL).await;
        }
        warn!(
            in_flight = self.activity.transfers(),
            max, "no transport headroom, dispatching anyway"
        );
    }

    fn finish_if_drained(&self, scope: &RunScope) -> Option<DownloadEvent> {
        let mut ledger = self.ledger.lock();
        if !ledger.is_current(scope) || ledger.pending_len() > 0 || !ledger.active().is_empty() {
            return None;
        }

        let completed = ledger.completed().len();
        let failed = ledger.failed().len();
        let run = ledger.run.as_mut()?;
        run.finish(RunStatus::Succeeded);
        info!(
            run = scope.id,
            completed,
            failed,
            elapsed_ms = run.elapsed().as_millis() as u64,
            "download run finished"
        );
        Some(DownloadEvent::RunSucceeded { completed, failed })
    }

    /// Spawn one step of `fulfiller`.
    fn launch(self: &Arc<Self>, scope: RunScope, mut fulfiller: Fulfiller) {
        let mut guard = self.activity.enter_task();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = fulfiller.advance(&inner.transport).await;
            guard.end_transfer();
            inner.on_step_complete(scope, fulfiller, outcome).await;
            drop(guard);
        });
    }

    async fn on_step_complete(
        self: &Arc<Self>,
        scope: RunScope,
        mut fulfiller: Fulfiller,
        outcome: StepOutcome,
    ) {
        let _guard = self.lock.acquire().await;
        let uri = fulfiller.uri().to_string();

        let disposition = {
            let ledger = self.ledger.lock();
            let entry = ledger
                .entry(&uri)
                .filter(|e| e.owns(&fulfiller) && e.status == TargetStatus::Active);
            match entry {
                Some(entry) if ledger.is_current(&scope) => {
                    if entry.cancel_requested {
                        Disposition::Cancelled
                    } else {
                        match outcome {
                            StepOutcome::Progressed { progress } => {
                                Disposition::Continue { progress }
                            }
                            StepOutcome::Finished => Disposition::Succeeded,
                            StepOutcome::Failed(e) => Disposition::Failed(e),
                        }
                    }
                }
                _ => Disposition::Stale,
            }
        };

        let mut events = Vec::new();
        match disposition {
            Disposition::Stale => {
                debug!(uri, run = scope.id, "step returned after its run ended");
                if scope.abandon_on_failure {
                    fulfiller.rollback().await;
                }
                let current = {
                    let mut ledger = self.ledger.lock();
                    ledger.park(fulfiller);
                    ledger.running_scope().cloned()
                };
                if let Some(current) = current {
                    events.extend(self.fill_slots(&current).await);
                }
            }
            Disposition::Cancelled => {
                fulfiller.rollback().await;
                {
                    let mut ledger = self.ledger.lock();
                    ledger.mark_failed(&uri, FailureReason::Cancelled);
                    ledger.park(fulfiller);
                }
                info!(uri, "active target cancelled");
                events.push(DownloadEvent::TargetCancelled { uri });
                events.extend(self.fill_slots(&scope).await);
            }
            Disposition::Continue { progress } => {
                let bytes_downloaded = fulfiller.meter().bytes_downloaded();
                self.flush(&[DownloadEvent::TargetProgressed {
                    uri,
                    progress,
                    bytes_downloaded,
                }]);
                self.launch(scope, fulfiller);
                return;
            }
            Disposition::Succeeded => {
                let meter = fulfiller.meter();
                let path = fulfiller.destination().to_path_buf();
                if fulfiller.is_chunked() {
                    events.push(DownloadEvent::TargetProgressed {
                        uri: uri.clone(),
                        progress: 1.0,
                        bytes_downloaded: meter.bytes_downloaded(),
                    });
                }
                {
                    let mut ledger = self.ledger.lock();
                    ledger.mark_completed(&uri);
                    ledger.park(fulfiller);
                }
                info!(
                    uri,
                    bytes = meter.bytes_downloaded(),
                    elapsed_ms = meter.elapsed().as_millis() as u64,
                    "target complete"
                );
                events.push(DownloadEvent::TargetSucceeded { uri, path });
                events.extend(self.fill_slots(&scope).await);
            }
            Disposition::Failed(error) => {
                warn!(uri, error = %error, "target failed");
                let code = error.code();
                let message = error.to_string();
                events.push(DownloadEvent::TargetFailed {
                    uri: uri.clone(),
                    code,
                    message: message.clone(),
                });

                let stops = {
                    let mut ledger = self.ledger.lock();
                    ledger.mark_failed(
                        &uri,
                        FailureReason::Transport {
                            code,
                            message: message.clone(),
                        },
                    );
                    ledger.run.as_ref().is_some_and(|r| r.stops_on_failure())
                };

                if stops {
                    if scope.abandon_on_failure {
                        fulfiller.rollback().await;
                    }
                    self.ledger.lock().park(fulfiller);
                    let reason = AbortReason::Failure { uri, code, message };
                    events.extend(
                        self.abort_run(&scope, reason, FailureReason::Abandoned)
                            .await,
                    );
                } else {
                    self.ledger.lock().park(fulfiller);
                    events.extend(self.fill_slots(&scope).await);
                }
            }
        }
        self.flush(&events);
    }

    /// Stop the run identified by `scope`. Caller holds the dispatch lock.
    ///
    /// Pending and active targets move to the failed set with
    /// `remaining`. With the abandon policy every target file is deleted;
    /// in-flight steps delete theirs again when they return.
    async fn abort_run(
        &self,
        scope: &RunScope,
        reason: AbortReason,
        remaining: FailureReason,
    ) -> Vec<DownloadEvent> {
        let doomed: Vec<PathBuf> = {
            let mut ledger = self.ledger.lock();
            let is_this_run = ledger
                .running_scope()
                .is_some_and(|running| running.id == scope.id);
            if !is_this_run {
                return Vec::new();
            }

            scope.token.cancel();
            let moved = ledger.fail_remaining(remaining);
            if let Some(run) = ledger.run.as_mut() {
                run.finish(RunStatus::Aborted);
            }
            info!(
                run = scope.id,
                reason = ?reason,
                abandoned = moved.len(),
                "download run aborted"
            );

            if scope.abandon_on_failure {
                ledger
                    .entries()
                    .map(|e| e.target.destination.clone())
                    .collect()
            } else {
                Vec::new()
            }
        };

        for path in &doomed {
            remove_file(path).await;
        }

        vec![DownloadEvent::RunAborted { reason }]
    }

    /// Deliver events, then publish the run status to waiters.
    fn flush(&self, events: &[DownloadEvent]) {
        self.events.emit_all(events);
        let status = self.ledger.lock().run_status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Fail if another registered target already writes to `target`'s path.
fn claim_destination(ledger: &Ledger, target: &Target) -> FetchResult<()> {
    match ledger.destination_owner(&target.destination) {
        Some(existing) => Err(FetchError::DuplicateDestination {
            uri: target.uri.clone(),
            path: target.destination.clone(),
            existing: existing.to_string(),
        }),
        None => Ok(()),
    }
}
