//! Fire-and-forget lifecycle notifications.
//!
//! Events fan out synchronously to every registered listener. Each listener
//! invocation runs inside its own panic guard: a failing listener never
//! reaches the worker loop, it is logged and surfaced once as
//! [`Event::SchedulerError`]. Listeners carrying job snapshots receive the
//! record as the emitting worker saw it; there is no ordering guarantee
//! across workers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::job::Job;

/// A lifecycle notification.
#[derive(Debug, Clone)]
pub enum Event {
    SchedulerStart,
    SchedulerStop,
    /// Internal, observability-only failure: storage hiccups, listener
    /// panics. The data path is unaffected.
    SchedulerError { message: String },
    WorkerStart { worker_id: String },
    WorkerStop { worker_id: String },
    WorkerError { worker_id: String, message: String },
    JobCreated { job: Job },
    JobStart { job: Job },
    JobSuccess { job: Job },
    JobFail { job: Job, error: String },
    JobRetry { job: Job, error: String, next_run_at: DateTime<Utc> },
    JobComplete { job: Job },
    JobCancel { job: Job },
}

impl Event {
    /// The wire name of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SchedulerStart => "scheduler:start",
            Self::SchedulerStop => "scheduler:stop",
            Self::SchedulerError { .. } => "scheduler:error",
            Self::WorkerStart { .. } => "worker:start",
            Self::WorkerStop { .. } => "worker:stop",
            Self::WorkerError { .. } => "worker:error",
            Self::JobCreated { .. } => "job:created",
            Self::JobStart { .. } => "job:start",
            Self::JobSuccess { .. } => "job:success",
            Self::JobFail { .. } => "job:fail",
            Self::JobRetry { .. } => "job:retry",
            Self::JobComplete { .. } => "job:complete",
            Self::JobCancel { .. } => "job:cancel",
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Synchronous fan-out bus for [`Event`]s.
///
/// Cloning is cheap and clones observe the same listener set. Listeners must
/// not block: they run inline on the emitting worker's task. Long-running
/// reactions belong behind a channel send.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for every event kind.
    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Delivers `event` to every listener, isolating panics per listener.
    pub fn emit(&self, event: Event) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut failed = 0usize;
        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                failed += 1;
            }
        }
        if failed == 0 {
            return;
        }
        tracing::error!(
            event = event.name(),
            failed,
            "event listener panicked while handling event"
        );
        // Surface the failure once, but never recurse through a listener
        // that panics on scheduler:error itself.
        if !matches!(event, Event::SchedulerError { .. }) {
            let error = Event::SchedulerError {
                message: format!("listener panicked while handling {}", event.name()),
            };
            for listener in &listeners {
                let _ = panic::catch_unwind(AssertUnwindSafe(|| listener(&error)));
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
