//! quenda — a distributed job scheduler core.
//!
//! Jobs persist in a shared store; any number of cooperating worker
//! processes acquire them under time-bounded locks, run registered handlers
//! with a concurrent lock heartbeat, and finalize through ownership-checked
//! writes. At most one worker executes a given job at a time, across the
//! whole fleet, through arbitrary crashes: abandoned locks expire and are
//! reclaimed, and a worker that lost its lock cannot overwrite the new
//! owner's state.
//!
//! The in-memory store backs tests and single-process embedding; the
//! `quenda-mongo` crate provides the shared MongoDB store for real fleets.
//!
//! ```no_run
//! use quenda::prelude::*;
//! use quenda::store::memory::MemoryStore;
//!
//! # async fn demo() -> Result<(), SchedulerError> {
//! let scheduler = Supervisor::new(MemoryStore::new())
//!     .with_workers(2)
//!     .register("send-email", handler_fn(|job| async move {
//!         tracing::info!(data = %job.data, "sending");
//!         Ok(())
//!     }));
//!
//! scheduler.start().await?;
//! scheduler
//!     .submit(JobBuilder::new("send-email").retry(3).build()?)
//!     .await?;
//! scheduler.stop(StopOptions::default()).await;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod event;
pub mod handler;
pub mod job;
pub mod planner;
pub mod prelude;
pub mod pruner;
pub mod retry;
pub mod store;
mod worker;

use event::{Event, EventBus};
use handler::{HandlerRegistry, JobHandler};
use job::{Job, JobId, NewJob, ValidationError};
use pruner::runner::PrunerRunner;
use pruner::PrunerConfig;
use store::{JobStore, StoreError};
use worker::{Worker, WorkerConfig};

/// Errors surfaced by the scheduler's public surface.
///
/// Data-path failures never crash the scheduler; they show up as events and
/// job state. Only submission rejections and store failures on the calling
/// path reach the caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fleet-level tuning shared by every worker of one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Identity prefix; workers are named `"<id>-w<i>"`.
    pub id: String,
    /// Number of workers to fan out (at least 1).
    pub workers: usize,
    pub poll_interval: Duration,
    pub lock_timeout: TimeDelta,
    pub default_timezone: Tz,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            id: format!("quenda-{}", uuid::Uuid::new_v4()),
            workers: 1,
            poll_interval: Duration::from_millis(500),
            lock_timeout: TimeDelta::minutes(10),
            default_timezone: Tz::UTC,
        }
    }
}

/// How [`Supervisor::stop`] winds the fleet down.
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Await in-flight executions before returning.
    pub graceful: bool,
    /// Upper bound on the graceful wait. On timeout the supervisor returns;
    /// orphaned handlers keep running and either finalize normally or lose
    /// ownership when they try.
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout: Duration::from_secs(30),
        }
    }
}

impl StopOptions {
    /// Signal shutdown and return without waiting.
    pub fn immediate() -> Self {
        Self {
            graceful: false,
            timeout: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    running: bool,
    shutdown: Option<CancellationToken>,
    workers: Vec<JoinHandle<()>>,
    pruner: Option<JoinHandle<()>>,
}

/// Orchestrates N workers over one store.
///
/// [`Supervisor::start`] and [`Supervisor::stop`] are idempotent; startup
/// runs stale-lock recovery once before any worker polls, so locks abandoned
/// by a crashed process are released before the fleet competes for work.
pub struct Supervisor<S> {
    store: S,
    registry: HandlerRegistry,
    events: EventBus,
    config: SupervisorConfig,
    pruner: Option<PrunerConfig>,
    state: tokio::sync::Mutex<SupervisorState>,
}

impl<S> Supervisor<S>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            events: EventBus::new(),
            config: SupervisorConfig::default(),
            pruner: None,
            state: tokio::sync::Mutex::new(SupervisorState::default()),
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: TimeDelta) -> Self {
        self.config.lock_timeout = lock_timeout;
        self
    }

    /// Runs the given retention rules on their schedule for as long as the
    /// scheduler is started.
    pub fn with_job_pruner(mut self, config: PrunerConfig) -> Self {
        self.pruner = Some(config);
        self
    }

    /// Registers `handler` for jobs named `name`.
    pub fn register(self, name: impl Into<String>, handler: impl JobHandler + 'static) -> Self {
        self.registry.register(name, handler);
        self
    }

    /// Registers a lifecycle event listener. Listeners must not block; their
    /// panics are contained and reported as `scheduler:error`.
    pub fn on_event(self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.events.subscribe(listener);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Starts the fleet. Idempotent: repeated calls while running are no-ops.
    ///
    /// This is the only place a store failure surfaces to the caller; once
    /// the workers are up, storage trouble is reported through events and
    /// retried by polling.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }

        tracing::info!(
            supervisor = %self.config.id,
            workers = self.config.workers,
            "scheduler starting"
        );
        self.events.emit(Event::SchedulerStart);

        let recovered = self
            .store
            .recover_stale_jobs(Utc::now(), self.config.lock_timeout)
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "released stale job locks at startup");
        }

        let shutdown = CancellationToken::new();
        let mut workers = Vec::with_capacity(self.config.workers.max(1));
        for index in 0..self.config.workers.max(1) {
            let worker = Worker::new(
                self.store.clone(),
                self.registry.clone(),
                self.events.clone(),
                WorkerConfig {
                    worker_id: format!("{}-w{index}", self.config.id),
                    poll_interval: self.config.poll_interval,
                    lock_timeout: self.config.lock_timeout,
                    default_timezone: self.config.default_timezone,
                },
                shutdown.child_token(),
            );
            workers.push(tokio::spawn(worker.run()));
        }
        state.pruner = self.pruner.as_ref().map(|config| {
            PrunerRunner::new(self.store.clone(), config.clone()).spawn(shutdown.child_token())
        });

        state.shutdown = Some(shutdown);
        state.workers = workers;
        state.running = true;
        Ok(())
    }

    /// Stops the fleet. Idempotent: repeated calls are no-ops.
    ///
    /// Workers and the pruner observe the shutdown signal at their next
    /// suspension point; with `graceful` the call awaits them up to
    /// `timeout` and returns cleanly either way.
    pub async fn stop(&self, options: StopOptions) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }

        tracing::info!(supervisor = %self.config.id, "scheduler stopping");
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.cancel();
        }
        let mut tasks = std::mem::take(&mut state.workers);
        tasks.extend(state.pruner.take());
        if options.graceful {
            let drained = tokio::time::timeout(options.timeout, futures::future::join_all(tasks));
            if drained.await.is_err() {
                tracing::warn!(
                    timeout_ms = options.timeout.as_millis() as u64,
                    "graceful stop timed out; outstanding handlers will finish or lose ownership"
                );
            }
        }
        state.running = false;
        self.events.emit(Event::SchedulerStop);
    }

    /// Validates and persists a submission, emitting `job:created`.
    pub async fn submit(&self, new_job: NewJob) -> Result<Job, SchedulerError> {
        new_job.validate()?;
        let job = self.store.create(new_job).await?;
        self.events.emit(Event::JobCreated { job: job.clone() });
        Ok(job)
    }

    /// Batch submission; validation is all-or-nothing, creation is atomic
    /// per record.
    pub async fn submit_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<Job>, SchedulerError> {
        for new_job in &new_jobs {
            new_job.validate()?;
        }
        let jobs = self.store.create_bulk(new_jobs).await?;
        for job in &jobs {
            self.events.emit(Event::JobCreated { job: job.clone() });
        }
        Ok(jobs)
    }

    /// Cancels a job in any state, emitting `job:cancel`.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, SchedulerError> {
        let job = self.store.cancel(id).await?;
        self.events.emit(Event::JobCancel { job: job.clone() });
        Ok(job)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::handler_fn;
    use crate::job::builder::JobBuilder;
    use crate::job::JobStatus;
    use crate::retry::RetrySpec;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn quick_config() -> SupervisorConfig {
        SupervisorConfig {
            id: "test-sup".to_owned(),
            workers: 1,
            poll_interval: Duration::from_millis(10),
            lock_timeout: TimeDelta::minutes(5),
            default_timezone: Tz::UTC,
        }
    }

    fn capture(events: &EventBus) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            events.subscribe(move |event| seen.lock().unwrap().push(event.name().to_owned()));
        }
        seen
    }

    fn count_of(seen: &Arc<Mutex<Vec<String>>>, name: &str) -> usize {
        seen.lock().unwrap().iter().filter(|n| *n == name).count()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) {
        let until = tokio::time::Instant::now() + deadline;
        while !condition() {
            assert!(
                tokio::time::Instant::now() < until,
                "condition not reached within {deadline:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn retry_exhaustion_runs_handler_exactly_max_attempts_times() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let calls = calls.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "always-fails",
                    handler_fn(move |_job| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err("persistent failure".into())
                        }
                    }),
                )
        };
        let seen = capture(scheduler.events());

        scheduler.start().await.unwrap();
        let job = scheduler
            .submit(
                JobBuilder::new("always-fails")
                    .retry(RetrySpec::fixed(3, 10))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        {
            let seen = seen.clone();
            wait_for(
                move || seen.lock().unwrap().iter().any(|n| n == "job:fail"),
                Duration::from_secs(5),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let finished = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.attempts, 3);
        assert_eq!(finished.last_error.as_deref(), Some("persistent failure"));
        assert_eq!(count_of(&seen, "job:retry"), 2);
        assert_eq!(count_of(&seen, "job:fail"), 1);
    }

    #[tokio::test]
    async fn cron_schedule_does_not_drift_with_handler_duration() {
        let store = MemoryStore::new();
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let scheduler = {
            let starts = starts.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "every-second",
                    handler_fn(move |_job| {
                        starts.lock().unwrap().push(Instant::now());
                        async move {
                            tokio::time::sleep(Duration::from_millis(80)).await;
                            Ok(())
                        }
                    }),
                )
        };

        scheduler.start().await.unwrap();
        scheduler
            .submit(
                JobBuilder::new("every-second")
                    .cron("*/1 * * * * *")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        {
            let starts = starts.clone();
            wait_for(
                move || starts.lock().unwrap().len() >= 4,
                Duration::from_secs(10),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;

        let starts = starts.lock().unwrap();
        // Skip the initial acquisition (not slot-aligned); successive slot
        // deltas must hover around one second regardless of the 80ms handler.
        for pair in starts[1..].windows(2) {
            let delta = pair[1] - pair[0];
            assert!(
                delta >= Duration::from_millis(500) && delta <= Duration::from_millis(1500),
                "cron slot delta drifted: {delta:?}"
            );
        }
    }

    #[tokio::test]
    async fn interval_schedule_drifts_with_handler_duration() {
        let store = MemoryStore::new();
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let scheduler = {
            let starts = starts.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "drifting",
                    handler_fn(move |_job| {
                        starts.lock().unwrap().push(Instant::now());
                        async move {
                            tokio::time::sleep(Duration::from_millis(120)).await;
                            Ok(())
                        }
                    }),
                )
        };

        scheduler.start().await.unwrap();
        scheduler
            .submit(
                JobBuilder::new("drifting")
                    .every(100)
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        {
            let starts = starts.clone();
            wait_for(
                move || starts.lock().unwrap().len() >= 3,
                Duration::from_secs(5),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;

        let starts = starts.lock().unwrap();
        // Each cycle is handler time plus the interval: the schedule drifts,
        // the opposite of cron.
        for pair in starts.windows(2) {
            let delta = pair[1] - pair[0];
            assert!(
                delta >= Duration::from_millis(200),
                "interval cycle too fast: {delta:?}"
            );
        }
    }

    #[tokio::test]
    async fn missed_cron_slots_are_skipped_not_backfilled() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let calls = calls.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "behind",
                    handler_fn(move |_job| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
        };

        scheduler.start().await.unwrap();
        // Sixty notionally-missed one-second slots.
        scheduler
            .submit(
                JobBuilder::new("behind")
                    .cron("*/1 * * * * *")
                    .run_at(Utc::now() - TimeDelta::seconds(60))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        scheduler.stop(StopOptions::default()).await;

        let executed = calls.load(Ordering::SeqCst);
        assert!(
            executed >= 1 && executed < 5,
            "expected the backlog to be skipped, got {executed} executions"
        );
    }

    #[tokio::test]
    async fn single_worker_executes_in_priority_order() {
        let store = MemoryStore::new();
        let order: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let scheduler = {
            let order = order.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "ranked",
                    handler_fn(move |job| {
                        order.lock().unwrap().push(job.priority);
                        async move { Ok(()) }
                    }),
                )
        };

        // Submit before starting so all three are due simultaneously.
        let run_at = Utc::now() - TimeDelta::seconds(1);
        for priority in [10u8, 1, 5] {
            scheduler
                .submit(
                    JobBuilder::new("ranked")
                        .priority(priority)
                        .run_at(run_at)
                        .build()
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        scheduler.start().await.unwrap();

        {
            let order = order.clone();
            wait_for(
                move || order.lock().unwrap().len() == 3,
                Duration::from_secs(5),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;

        assert_eq!(*order.lock().unwrap(), vec![1, 5, 10]);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let scheduler = Supervisor::new(MemoryStore::new()).with_config(quick_config());
        let seen = capture(scheduler.events());

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert_eq!(count_of(&seen, "scheduler:start"), 1);

        scheduler.stop(StopOptions::default()).await;
        scheduler.stop(StopOptions::default()).await;
        assert_eq!(count_of(&seen, "scheduler:stop"), 1);
    }

    #[tokio::test]
    async fn startup_recovers_stale_locks_before_polling() {
        let store = MemoryStore::new();
        // A job left locked by a process that died long ago.
        store
            .create(crate::store::testing::due_job("orphaned"))
            .await
            .unwrap();
        let stale = crate::store::testing::lock_next_at(
            &store,
            "dead-worker",
            Utc::now() - TimeDelta::hours(1),
            TimeDelta::minutes(1),
        )
        .await
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let calls = calls.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "orphaned",
                    handler_fn(move |_job| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
        };

        scheduler.start().await.unwrap();
        {
            let calls = calls.clone();
            wait_for(
                move || calls.load(Ordering::SeqCst) >= 1,
                Duration::from_secs(5),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;

        let finished = store.find_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_ne!(finished.locked_by.as_deref(), Some("dead-worker"));
    }

    #[tokio::test]
    async fn graceful_stop_returns_after_timeout_with_handler_still_running() {
        let store = MemoryStore::new();
        let started = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let started = started.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "endless",
                    handler_fn(move |_job| {
                        started.fetch_add(1, Ordering::SeqCst);
                        async move {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            Ok(())
                        }
                    }),
                )
        };

        scheduler.start().await.unwrap();
        scheduler
            .submit(JobBuilder::new("endless").build().unwrap())
            .await
            .unwrap();
        {
            let started = started.clone();
            wait_for(
                move || started.load(Ordering::SeqCst) >= 1,
                Duration::from_secs(5),
            )
            .await;
        }

        let stop_started = Instant::now();
        scheduler
            .stop(StopOptions {
                graceful: true,
                timeout: Duration::from_millis(100),
            })
            .await;
        assert!(
            stop_started.elapsed() < Duration::from_secs(2),
            "stop must return at the timeout, not wait for the handler"
        );
    }

    #[tokio::test]
    async fn pruner_runs_with_the_fleet() {
        use crate::planner::parse_cron;
        use crate::pruner::{Pruner, PrunerConfig};

        let store = MemoryStore::new();
        // A finished record left over from earlier runs.
        store
            .create(crate::store::testing::due_job("stale-output"))
            .await
            .unwrap();
        let done = crate::store::testing::lock_next(&store, "w-old").await.unwrap();
        store.mark_completed(&done.id, "w-old").await.unwrap();

        let scheduler = Supervisor::new(store.clone())
            .with_config(quick_config())
            .with_job_pruner(
                PrunerConfig::new(parse_cron("* * * * * *").unwrap())
                    .with_pruner(Pruner::max_age(TimeDelta::zero(), JobStatus::Completed)),
            );
        scheduler.start().await.unwrap();

        {
            let store = store.clone();
            wait_for(
                move || {
                    futures::executor::block_on(
                        store.find_all(crate::store::Query::StatusEqual(JobStatus::Completed)),
                    )
                    .unwrap()
                    .is_empty()
                },
                Duration::from_secs(5),
            )
            .await;
        }
        scheduler.stop(StopOptions::default()).await;
    }

    #[tokio::test]
    async fn submit_rejects_invalid_jobs_without_creating_them() {
        let store = MemoryStore::new();
        let scheduler = Supervisor::new(store.clone()).with_config(quick_config());

        let mut bad = NewJob::new("bad");
        bad.priority = Some(99);
        assert!(matches!(
            scheduler.submit(bad).await,
            Err(SchedulerError::Validation(_))
        ));
        assert!(store
            .find_all(crate::store::Query::All)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancel_emits_event_and_prevents_execution() {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let calls = calls.clone();
            Supervisor::new(store.clone())
                .with_config(quick_config())
                .register(
                    "doomed",
                    handler_fn(move |_job| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
        };
        let seen = capture(scheduler.events());

        // Cancel before the scheduler ever runs it.
        let job = scheduler
            .submit(
                JobBuilder::new("doomed")
                    .run_in(TimeDelta::milliseconds(50))
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        scheduler.cancel(&job.id).await.unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop(StopOptions::default()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(count_of(&seen, "job:cancel"), 1);
        let current = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Cancelled);
    }
}
