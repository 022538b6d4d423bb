//! Bookkeeping for registered targets, the four URI sets, and the current
//! run.
//!
//! Every registered URI is in exactly one of `pending`, `active`,
//! `completed` or `failed`. The ledger is plain data; the orchestrator
//! guards it with a mutex and only changes sets while holding the dispatch
//! lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::fulfiller::{Fulfiller, TransferMeter};
use crate::target::Target;

/// Why a target ended in the failed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The transfer itself failed.
    Transport { code: i32, message: String },
    /// Cancelled by `cancel_one` or `cancel_all`.
    Cancelled,
    /// Dropped because another target failed under a stop-on-failure
    /// policy.
    Abandoned,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message, .. } => f.write_str(message),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Abandoned => f.write_str("abandoned after another target failed"),
        }
    }
}

/// Which set a target is in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    Pending,
    Active,
    Completed,
    Failed(FailureReason),
}

/// Lifecycle of the current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No run has started since construction or the last reset.
    Idle,
    Running,
    /// Finished with nothing left pending or active.
    Succeeded,
    /// Stopped by cancellation or a stop-on-failure policy.
    Aborted,
}

impl RunStatus {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// True for `Succeeded` and `Aborted`.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }
}

/// Per-run scope handed to every in-flight step.
#[derive(Debug, Clone)]
pub(crate) struct RunScope {
    pub id: u64,
    pub token: CancellationToken,
    pub abandon_on_failure: bool,
}

impl RunScope {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Metadata of one run. Frozen once the run finishes.
#[derive(Debug)]
pub(crate) struct RunMeta {
    pub scope: RunScope,
    pub status: RunStatus,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub finished: Option<Instant>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Targets this run is responsible for.
    pub initial_count: usize,
    /// Targets completed during this run.
    pub completed_count: usize,
    /// URIs counted in `initial_count`.
    pub members: HashSet<String>,
    /// Progress reported when the last target joined mid-run.
    pub progress_floor: f64,
    pub max_concurrency: usize,
    pub continue_after_failure: bool,
}

impl RunMeta {
    pub fn elapsed(&self) -> Duration {
        match self.finished {
            Some(end) => end.saturating_duration_since(self.started),
            None => self.started.elapsed(),
        }
    }

    /// Completed share of this run's targets.
    ///
    /// Never drops below the value reported before a target joined
    /// mid-run, and reaches 1.0 only once every member has completed.
    pub fn progress(&self) -> f64 {
        if self.initial_count == 0 {
            return 0.0;
        }
        let share = self.completed_count as f64 / self.initial_count as f64;
        share.max(self.progress_floor).min(1.0)
    }

    /// Count `uri` as part of this run. Returns false if it already was.
    pub fn join(&mut self, uri: &str) -> bool {
        if self.members.contains(uri) {
            return false;
        }
        self.progress_floor = self.progress();
        self.members.insert(uri.to_string());
        self.initial_count += 1;
        true
    }

    /// Stop abandons the run rather than continuing past a failure.
    pub fn stops_on_failure(&self) -> bool {
        self.scope.abandon_on_failure || !self.continue_after_failure
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished = Some(Instant::now());
        self.finished_at = Some(Utc::now());
    }
}

/// One registered target.
#[derive(Debug)]
pub(crate) struct TargetEntry {
    pub target: Arc<Target>,
    pub meter: Arc<TransferMeter>,
    /// `None` while the fulfiller is moved into an in-flight step.
    pub fulfiller: Option<Fulfiller>,
    pub status: TargetStatus,
    /// `cancel_one` was called while the target was active.
    pub cancel_requested: bool,
}

impl TargetEntry {
    pub fn new(target: Arc<Target>, chunk_size: u64) -> Self {
        let fulfiller = Fulfiller::new(Arc::clone(&target), chunk_size);
        Self {
            meter: fulfiller.meter(),
            target,
            fulfiller: Some(fulfiller),
            status: TargetStatus::Pending,
            cancel_requested: false,
        }
    }

    /// True if `fulfiller` was created for this entry.
    pub fn owns(&self, fulfiller: &Fulfiller) -> bool {
        Arc::ptr_eq(&self.meter, &fulfiller.meter())
    }

    pub fn in_flight(&self) -> bool {
        self.fulfiller.is_none()
    }
}

/// Registered targets and their set membership.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    entries: HashMap<String, TargetEntry>,
    /// Destination path to the URI writing it.
    destinations: HashMap<PathBuf, String>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    pending: VecDeque<String>,
    active: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    pub run: Option<RunMeta>,
    next_run_id: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    pub fn entry(&self, uri: &str) -> Option<&TargetEntry> {
        self.entries.get(uri)
    }

    pub fn entry_mut(&mut self, uri: &str) -> Option<&mut TargetEntry> {
        self.entries.get_mut(uri)
    }

    /// Entries in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &TargetEntry> {
        self.order.iter().filter_map(|uri| self.entries.get(uri))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// URI of the target writing to `path`, if any.
    pub fn destination_owner(&self, path: &Path) -> Option<&str> {
        self.destinations.get(path).map(String::as_str)
    }

    /// Register a target at the back of the pending queue.
    ///
    /// The caller checks for duplicate URIs and destinations first.
    pub fn register(&mut self, target: Arc<Target>, chunk_size: u64) {
        let uri = target.uri.clone();
        self.destinations
            .insert(target.destination.clone(), uri.clone());
        self.entries
            .insert(uri.clone(), TargetEntry::new(target, chunk_size));
        self.order.push(uri.clone());
        self.pending.push_back(uri);
    }

    pub fn status(&self, uri: &str) -> Option<&TargetStatus> {
        self.entries.get(uri).map(|e| &e.status)
    }

    pub fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.status.is_running())
    }

    /// Count a newly queued target in the running run.
    ///
    /// Returns false when no run is active or the target already belongs to
    /// it.
    pub fn join_run(&mut self, uri: &str) -> bool {
        match self.run.as_mut() {
            Some(run) if run.status.is_running() => run.join(uri),
            _ => false,
        }
    }

    pub fn run_status(&self) -> RunStatus {
        self.run.as_ref().map_or(RunStatus::Idle, |r| r.status)
    }

    /// The running run's scope, if any.
    pub fn running_scope(&self) -> Option<&RunScope> {
        self.run
            .as_ref()
            .filter(|r| r.status.is_running())
            .map(|r| &r.scope)
    }

    /// True if `scope` is the run currently in progress and not cancelled.
    pub fn is_current(&self, scope: &RunScope) -> bool {
        self.running_scope()
            .is_some_and(|s| s.id == scope.id && !s.is_cancelled())
    }

    /// Start a new run over whatever is pending.
    pub fn begin_run(
        &mut self,
        max_concurrency: usize,
        abandon_on_failure: bool,
        continue_after_failure: bool,
    ) -> RunScope {
        self.next_run_id += 1;
        let scope = RunScope {
            id: self.next_run_id,
            token: CancellationToken::new(),
            abandon_on_failure,
        };
        self.run = Some(RunMeta {
            scope: scope.clone(),
            status: RunStatus::Running,
            started: Instant::now(),
            started_at: Utc::now(),
            finished: None,
            finished_at: None,
            initial_count: self.pending.len(),
            completed_count: 0,
            members: self.pending.iter().cloned().collect(),
            progress_floor: 0.0,
            max_concurrency,
            continue_after_failure,
        });
        scope
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Failed URIs with their reasons.
    pub fn failures(&self) -> Vec<(String, FailureReason)> {
        self.failed
            .iter()
            .filter_map(|uri| match self.status(uri) {
                Some(TargetStatus::Failed(reason)) => Some((uri.clone(), reason.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn has_dispatchable(&self) -> bool {
        self.pending
            .iter()
            .any(|uri| self.entries.get(uri).is_some_and(|e| !e.in_flight()))
    }

    /// Move the first pending target whose fulfiller is at rest to the
    /// active set and hand out its fulfiller.
    ///
    /// Targets whose fulfiller is still out with a step from an earlier run
    /// stay queued until it comes back.
    pub fn take_next(&mut self) -> Option<Fulfiller> {
        let position = self
            .pending
            .iter()
            .position(|uri| self.entries.get(uri).is_some_and(|e| !e.in_flight()))?;
        let uri = self.pending.remove(position)?;
        let entry = self.entries.get_mut(&uri)?;
        entry.status = TargetStatus::Active;
        entry.cancel_requested = false;
        self.active.push(uri);
        entry.fulfiller.take()
    }

    /// Move `uri` to the completed set.
    pub fn mark_completed(&mut self, uri: &str) {
        self.transition(uri, TargetStatus::Completed);
        if let Some(run) = self.run.as_mut() {
            run.completed_count += 1;
        }
    }

    /// Move `uri` to the failed set.
    pub fn mark_failed(&mut self, uri: &str, reason: FailureReason) {
        self.transition(uri, TargetStatus::Failed(reason));
    }

    /// Put a failed target back in the pending queue.
    ///
    /// Returns false if the target is not in the failed set.
    pub fn requeue(&mut self, uri: &str) -> bool {
        if !matches!(self.status(uri), Some(TargetStatus::Failed(_))) {
            return false;
        }
        self.transition(uri, TargetStatus::Pending);
        if let Some(fulfiller) = self
            .entries
            .get_mut(uri)
            .and_then(|e| e.fulfiller.as_mut())
        {
            fulfiller.reset_for_retry();
        }
        true
    }

    /// Move every pending and active target to the failed set.
    ///
    /// Returns the URIs moved.
    pub fn fail_remaining(&mut self, reason: FailureReason) -> Vec<String> {
        let mut moved: Vec<String> = self.pending.iter().cloned().collect();
        moved.extend(self.active.iter().cloned());
        for uri in &moved {
            self.transition(uri, TargetStatus::Failed(reason.clone()));
        }
        moved
    }

    /// Return a fulfiller from an in-flight step to its entry.
    ///
    /// A fulfiller whose entry was reset away (or replaced by a new
    /// registration) is handed back to the caller.
    pub fn park(&mut self, mut fulfiller: Fulfiller) -> Option<Fulfiller> {
        let Some(entry) = self.entries.get_mut(fulfiller.uri()) else {
            return Some(fulfiller);
        };
        if !entry.owns(&fulfiller) || entry.fulfiller.is_some() {
            return Some(fulfiller);
        }
        if entry.status == TargetStatus::Pending {
            fulfiller.reset_for_retry();
        }
        entry.fulfiller = Some(fulfiller);
        None
    }

    /// Drop every target and the run metadata.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.destinations.clear();
        self.order.clear();
        self.pending.clear();
        self.active.clear();
        self.completed.clear();
        self.failed.clear();
        self.run = None;
    }

    fn transition(&mut self, uri: &str, status: TargetStatus) {
        let Some(entry) = self.entries.get_mut(uri) else {
            return;
        };

        match entry.status {
            TargetStatus::Pending => self.pending.retain(|u| u != uri),
            TargetStatus::Active => self.active.retain(|u| u != uri),
            TargetStatus::Completed => self.completed.retain(|u| u != uri),
            TargetStatus::Failed(_) => self.failed.retain(|u| u != uri),
        }
        match status {
            TargetStatus::Pending => self.pending.push_back(uri.to_string()),
            TargetStatus::Active => self.active.push(uri.to_string()),
            TargetStatus::Completed => self.completed.push(uri.to_string()),
            TargetStatus::Failed(_) => self.failed.push(uri.to_string()),
        }
        entry.status = status;
        entry.cancel_requested = false;
    }
}
