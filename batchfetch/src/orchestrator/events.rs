//! Download signals and the listener list that delivers them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

/// Why a run stopped before every target finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// `cancel_all` was called.
    Cancelled,
    /// A target failed under a stop-on-failure policy.
    Failure {
        uri: String,
        code: i32,
        message: String,
    },
}

/// A signal emitted by the [`Downloader`](super::Downloader).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// A run began; `targets` is the number it was started over.
    RunStarted { run_id: u64, targets: usize },
    /// A target's file is complete.
    TargetSucceeded { uri: String, path: PathBuf },
    /// A chunk of a chunked transfer landed.
    TargetProgressed {
        uri: String,
        progress: f64,
        bytes_downloaded: u64,
    },
    /// A target failed with a transport error.
    TargetFailed {
        uri: String,
        code: i32,
        message: String,
    },
    /// A target was cancelled with `cancel_one`.
    TargetCancelled { uri: String },
    /// The run finished with nothing pending or active.
    RunSucceeded { completed: usize, failed: usize },
    /// The run was stopped early.
    RunAborted { reason: AbortReason },
}

impl DownloadEvent {
    /// The target URI, for per-target events.
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::TargetSucceeded { uri, .. }
            | Self::TargetProgressed { uri, .. }
            | Self::TargetFailed { uri, .. }
            | Self::TargetCancelled { uri } => Some(uri),
            Self::RunStarted { .. } | Self::RunSucceeded { .. } | Self::RunAborted { .. } => None,
        }
    }

    /// True for the two run-level terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunSucceeded { .. } | Self::RunAborted { .. })
    }
}

/// Callback invoked for every [`DownloadEvent`].
pub type EventListener = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// Ordered list of listeners.
///
/// Listeners run synchronously on the task that emits the event, in
/// registration order. A panicking listener is logged and skipped; the
/// remaining listeners still run. Each emit works on a copy of the list, so
/// a listener may subscribe further listeners; those see the next event.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<EventListener>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener.
    pub fn emit(&self, event: &DownloadEvent) {
        let listeners: Vec<EventListener> = self.listeners.read().clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(listener = index, ?event, "event listener panicked");
            }
        }
    }

    /// Deliver a batch of events in order.
    pub fn emit_all(&self, events: &[DownloadEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn cancelled(uri: &str) -> DownloadEvent {
        DownloadEvent::TargetCancelled {
            uri: uri.to_string(),
        }
    }

    #[test]
    fn test_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| seen.lock().push(id));
        }
        bus.emit(&cancelled("http://a"));

        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));

        bus.subscribe(|_| panic!("listener bug"));
        let counter = Arc::clone(&seen);
        bus.subscribe(move |_| *counter.lock() += 1);

        bus.emit(&cancelled("http://a"));
        bus.emit(&cancelled("http://b"));

        assert_eq!(*seen.lock(), 2);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_listener_may_subscribe() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(0));

        let registrar = Arc::clone(&bus);
        let counter = Arc::clone(&seen);
        bus.subscribe(move |_| {
            let counter = Arc::clone(&counter);
            registrar.subscribe(move |_| *counter.lock() += 1);
        });

        bus.emit(&cancelled("http://a"));
        assert_eq!(bus.len(), 2);
        assert_eq!(*seen.lock(), 0);

        bus.emit(&cancelled("http://b"));
        assert_eq!(bus.len(), 3);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_event_uri_and_terminal() {
        assert_eq!(cancelled("http://a").uri(), Some("http://a"));

        let done = DownloadEvent::RunSucceeded {
            completed: 1,
            failed: 0,
        };
        assert_eq!(done.uri(), None);
        assert!(done.is_terminal());
        assert!(!cancelled("http://a").is_terminal());

        let started = DownloadEvent::RunStarted {
            run_id: 1,
            targets: 3,
        };
        assert_eq!(started.uri(), None);
        assert!(!started.is_terminal());
    }
}
