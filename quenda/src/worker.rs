//! The acquire–execute–finalize loop for one worker identity.
//!
//! A worker owns no state besides its configuration: every cross-worker
//! interaction goes through the store's atomic operations. While a handler
//! runs, a concurrent heartbeat task extends the lock lease; if the lease is
//! lost anyway (long GC pause, network partition, clock skew), the
//! ownership-checked finalization writes are the backstop that keeps a
//! starved worker from overwriting a reclaimed job.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventBus};
use crate::handler::{HandlerError, HandlerRegistry};
use crate::job::{Job, JobId, JobStatus};
use crate::planner;
use crate::store::{JobStore, LockRequest, StoreError};

/// Tuning for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Globally unique worker identity; recorded in `lockedBy`.
    pub worker_id: String,
    /// Idle delay between polls when no job is due.
    pub poll_interval: Duration,
    /// Initial lock lease; the heartbeat renews it at half this interval.
    pub lock_timeout: TimeDelta,
    /// Timezone for cron specs that do not carry their own.
    pub default_timezone: Tz,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_owned(),
            poll_interval: Duration::from_millis(500),
            lock_timeout: TimeDelta::minutes(10),
            default_timezone: Tz::UTC,
        }
    }
}

fn heartbeat_interval(lock_timeout: TimeDelta) -> Duration {
    let half = (lock_timeout / 2).to_std().unwrap_or_default();
    half.max(Duration::from_millis(50))
}

pub(crate) struct Worker<S> {
    store: S,
    registry: HandlerRegistry,
    events: EventBus,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl<S> Worker<S>
where
    S: JobStore + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        store: S,
        registry: HandlerRegistry,
        events: EventBus,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            config,
            shutdown,
        }
    }

    /// Polls until shutdown is signalled. The idle sleep is interruptible so
    /// a stop request never waits out a poll interval.
    pub(crate) async fn run(self) {
        let worker_id = self.config.worker_id.clone();
        tracing::debug!(%worker_id, "worker started");
        self.events.emit(Event::WorkerStart {
            worker_id: worker_id.clone(),
        });

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let request = LockRequest {
                now: Utc::now(),
                worker_id: worker_id.clone(),
                lock_timeout: self.config.lock_timeout,
            };
            match self.store.find_and_lock_next(request).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(err) => {
                    tracing::error!(%worker_id, ?err, "failed to poll for jobs");
                    self.worker_error(format!("failed to poll for jobs: {err}"));
                    // Back off instead of hammering a broken store.
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }

        tracing::debug!(%worker_id, "worker stopped");
        self.events.emit(Event::WorkerStop { worker_id });
    }

    fn worker_error(&self, message: String) {
        self.events.emit(Event::WorkerError {
            worker_id: self.config.worker_id.clone(),
            message,
        });
    }

    /// Runs one acquired job to finalization.
    async fn execute(&self, job: Job) {
        let worker_id = self.config.worker_id.as_str();
        self.events.emit(Event::JobStart { job: job.clone() });

        // The guard cancels the heartbeat on every exit path, panics
        // included.
        let heartbeat = self.spawn_heartbeat(job.id.clone());
        let _heartbeat_guard = heartbeat.drop_guard();

        // Pre-flight: the job may have been cancelled, deleted, or reclaimed
        // between acquisition and now.
        let job = match self.store.find_by_id(&job.id).await {
            Ok(Some(current)) => {
                if current.status == JobStatus::Cancelled {
                    self.events.emit(Event::JobComplete { job: current });
                    return;
                }
                if current.locked_by.as_deref() != Some(worker_id) {
                    self.worker_error(format!(
                        "lock on job {} was taken by another worker",
                        current.id
                    ));
                    return;
                }
                if current.status != JobStatus::Running {
                    self.worker_error(format!("job {} is no longer running", current.id));
                    return;
                }
                current
            }
            Ok(None) => return,
            Err(err) => {
                self.worker_error(format!("pre-flight read of job {} failed: {err}", job.id));
                return;
            }
        };

        // Cron slots are committed before the handler runs, so a crash
        // mid-handler never replays the current slot and execution time never
        // pushes the schedule.
        if let Some(repeat) = job.repeat.clone().filter(|repeat| repeat.cron.is_some()) {
            if !self.commit_next_cron_slot(&job, &repeat).await {
                return;
            }
        }

        let outcome = match self.registry.get(&job.name) {
            Some(handler) => {
                let handler_job = job.clone();
                match tokio::spawn(async move { handler.run(handler_job).await }).await {
                    Ok(result) => result,
                    Err(join_err) => Err(HandlerError::from_join_error(join_err)),
                }
            }
            None => Err(HandlerError::new(format!(
                "no handler registered for job '{}'",
                job.name
            ))),
        };

        match outcome {
            Ok(()) => self.finalize_success(job).await,
            Err(err) => self.finalize_failure(job, err).await,
        }
    }

    /// Advances the cron schedule past every missed slot and persists the
    /// next one. Returns false when execution must abort.
    async fn commit_next_cron_slot(&self, job: &Job, repeat: &crate::planner::RepeatSpec) -> bool {
        let now = Utc::now();
        let base = job.last_scheduled_at.or(job.next_run_at).unwrap_or(now);
        // Cron slots are calendar points independent of the base, so planning
        // from the later of the logical base and the wall clock skips the
        // whole missed backlog in one step. The result is strictly in the
        // future either way.
        let slot = match planner::next_run_at(repeat, base.max(now), self.config.default_timezone)
        {
            Ok(next) => next,
            Err(err) => {
                // A cron spec that validated at submission but no longer
                // evaluates is terminal; retrying cannot fix it.
                let message = format!("cron schedule for job {} failed: {err}", job.id);
                tracing::error!(job_id = %job.id, ?err, "cron schedule unusable");
                self.worker_error(message.clone());
                if let Err(err) = self
                    .store
                    .mark_failed(&job.id, &self.config.worker_id, &message)
                    .await
                {
                    tracing::error!(job_id = %job.id, ?err, "failed to fail job");
                }
                return false;
            }
        };
        match self.store.reschedule(&job.id, slot, None).await {
            Ok(_) => true,
            Err(err) => {
                self.worker_error(format!(
                    "failed to commit next cron slot for job {}: {err}",
                    job.id
                ));
                false
            }
        }
    }

    async fn finalize_success(&self, job: Job) {
        let worker_id = self.config.worker_id.as_str();
        match &job.repeat {
            Some(repeat) if repeat.every.is_some() => {
                // Interval repeats are planned from completion time: the
                // schedule drifts with execution, by design.
                let now = Utc::now();
                match planner::next_run_at(repeat, now, self.config.default_timezone) {
                    Ok(next) => {
                        if let Err(err) = self.store.reschedule(&job.id, next, None).await {
                            self.worker_error(format!(
                                "failed to reschedule job {}: {err}",
                                job.id
                            ));
                        } else {
                            self.events.emit(Event::JobSuccess { job: job.clone() });
                        }
                    }
                    Err(err) => {
                        self.worker_error(format!("failed to plan job {}: {err}", job.id));
                    }
                }
            }
            Some(_) => {
                // Cron: the next slot was committed before the handler ran.
                self.events.emit(Event::JobSuccess { job: job.clone() });
            }
            None => match self.store.mark_completed(&job.id, worker_id).await {
                Ok(_) => {
                    self.events.emit(Event::JobSuccess { job: job.clone() });
                }
                Err(StoreError::NotOwner(_)) | Err(StoreError::JobNotFound(_)) => {
                    // The lock was reclaimed mid-run; whoever owns the job
                    // now will finalize it. The handler's work stands.
                    self.worker_error(format!(
                        "completion of job {} rejected: lock no longer owned",
                        job.id
                    ));
                }
                Err(err) => {
                    self.worker_error(format!("failed to complete job {}: {err}", job.id));
                }
            },
        }
        self.events.emit(Event::JobComplete { job });
    }

    async fn finalize_failure(&self, job: Job, error: HandlerError) {
        let attempts = job.attempts + 1;
        let retry = job
            .retry
            .as_ref()
            .filter(|retry| retry.should_retry(attempts));

        if let Some(retry) = retry {
            let next_run_at = Utc::now() + retry.delay_for(attempts);
            match self
                .store
                .reschedule(&job.id, next_run_at, Some(attempts))
                .await
            {
                Ok(_) => {
                    tracing::warn!(
                        job_id = %job.id,
                        attempts,
                        %error,
                        "job failed, retrying"
                    );
                    self.events.emit(Event::JobRetry {
                        job,
                        error: error.to_string(),
                        next_run_at,
                    });
                }
                Err(err) => {
                    self.worker_error(format!(
                        "failed to schedule retry of job {}: {err}",
                        job.id
                    ));
                }
            }
            return;
        }

        tracing::error!(job_id = %job.id, attempts, %error, "job failed permanently");
        let _ = self
            .store
            .update(
                &job.id,
                crate::job::JobUpdate {
                    attempts: Some(attempts),
                    ..Default::default()
                },
            )
            .await
            .inspect_err(|err| {
                tracing::error!(job_id = %job.id, ?err, "failed to record attempts")
            });
        match self
            .store
            .mark_failed(&job.id, &self.config.worker_id, error.message())
            .await
        {
            Ok(_) => {
                self.events.emit(Event::JobFail {
                    job,
                    error: error.to_string(),
                });
            }
            Err(StoreError::NotOwner(_)) | Err(StoreError::JobNotFound(_)) => {
                self.worker_error(format!(
                    "failure of job {} rejected: lock no longer owned",
                    job.id
                ));
            }
            Err(err) => {
                self.worker_error(format!("failed to fail job {}: {err}", job.id));
            }
        }
    }

    /// Spawns the lock-renewal task for one job. The returned token stops it;
    /// it also stops itself after the first failed renewal, after which the
    /// running handler is on borrowed time.
    fn spawn_heartbeat(&self, id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        let store = self.store.clone();
        let events = self.events.clone();
        let worker_id = self.config.worker_id.clone();
        let lock_timeout = self.config.lock_timeout;
        let interval = heartbeat_interval(lock_timeout);
        tokio::spawn({
            let token = token.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(err) = store.renew_lock(&id, &worker_id, lock_timeout).await {
                                tracing::warn!(job_id = %id, %worker_id, ?err, "heartbeat failed");
                                events.emit(Event::WorkerError {
                                    worker_id: worker_id.clone(),
                                    message: format!("Heartbeat failed for job {id}: {err}"),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        });
        token
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::due_job;
    use crate::store::MockJobStore;
    use crate::{handler::handler_fn, store::Query};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn test_config(worker_id: &str) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.to_owned(),
            poll_interval: Duration::from_millis(20),
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

    async fn run_worker_until<S, F>(worker: Worker<S>, shutdown: CancellationToken, until: F)
    where
        S: JobStore + Clone + Send + Sync + 'static,
        F: Fn() -> bool,
    {
        let handle = tokio::spawn(worker.run());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !until() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "worker did not reach expected state in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn heartbeat_interval_has_a_floor() {
        assert_eq!(
            heartbeat_interval(TimeDelta::milliseconds(20)),
            Duration::from_millis(50)
        );
        assert_eq!(
            heartbeat_interval(TimeDelta::seconds(10)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn executes_due_job_and_completes_it() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();
        let events = EventBus::new();
        let seen = capture(&events);
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            registry.register(
                "work",
                handler_fn(move |_job| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }
        let job = store.create(due_job("work")).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            registry,
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let calls = calls.clone();
            run_worker_until(worker, shutdown, move || calls.load(Ordering::SeqCst) >= 1).await;
        }

        let finished = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert!(finished.locked_by.is_none());
        assert_eq!(count_of(&seen, "job:start"), 1);
        assert_eq!(count_of(&seen, "job:success"), 1);
        assert_eq!(count_of(&seen, "job:complete"), 1);
        assert_eq!(count_of(&seen, "worker:start"), 1);
        assert_eq!(count_of(&seen, "worker:stop"), 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_a_failure_not_a_crash() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();
        registry.register(
            "volatile",
            handler_fn(|_job| async { panic!("handler blew up") }),
        );
        let events = EventBus::new();
        let seen = capture(&events);
        let job = store.create(due_job("volatile")).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            registry,
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let store = store.clone();
            let id = job.id.clone();
            run_worker_until(worker, shutdown, move || {
                futures::executor::block_on(store.find_by_id(&id))
                    .unwrap()
                    .is_some_and(|job| job.status == JobStatus::Failed)
            })
            .await;
        }

        let failed = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("handler blew up"));
        assert_eq!(failed.attempts, 1);
        assert_eq!(count_of(&seen, "job:fail"), 1);
    }

    #[tokio::test]
    async fn job_without_handler_fails_visibly() {
        let store = MemoryStore::new();
        let events = EventBus::new();
        let seen = capture(&events);
        let job = store.create(due_job("unknown")).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            HandlerRegistry::new(),
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let store = store.clone();
            let id = job.id.clone();
            run_worker_until(worker, shutdown, move || {
                futures::executor::block_on(store.find_by_id(&id))
                    .unwrap()
                    .is_some_and(|job| job.status == JobStatus::Failed)
            })
            .await;
        }

        let failed = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(
            failed.last_error.as_deref(),
            Some("no handler registered for job 'unknown'")
        );
        assert_eq!(count_of(&seen, "job:fail"), 1);
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_after_acquisition() {
        // Stage the race with a mock: acquisition succeeds, but by pre-flight
        // the job reads back cancelled.
        let job = {
            let mut job = crate::store::testing::sample_job("late-cancel");
            job.status = JobStatus::Running;
            job.locked_by = Some("w1".to_owned());
            job.lock_until = Some(Utc::now() + TimeDelta::minutes(5));
            job
        };
        let mut mock = MockJobStore::new();
        {
            let job = job.clone();
            let mut acquired = Some(job);
            mock.expect_find_and_lock_next()
                .returning(move |_| Ok(acquired.take()));
        }
        {
            let mut job = job.clone();
            job.status = JobStatus::Cancelled;
            job.locked_by = None;
            job.lock_until = None;
            mock.expect_find_by_id()
                .returning(move |_| Ok(Some(job.clone())));
        }
        mock.expect_renew_lock()
            .returning(|id, _, _| Err(StoreError::LockLost(id.clone())));

        let events = EventBus::new();
        let seen = capture(&events);
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(mock),
            HandlerRegistry::new(),
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let seen = seen.clone();
            run_worker_until(worker, shutdown, move || {
                seen.lock().unwrap().iter().any(|n| n == "job:complete")
            })
            .await;
        }

        // Completed without ever invoking a handler or failing.
        assert_eq!(count_of(&seen, "job:complete"), 1);
        assert_eq!(count_of(&seen, "job:fail"), 0);
        assert_eq!(count_of(&seen, "job:success"), 0);
    }

    #[tokio::test]
    async fn stolen_lock_aborts_before_handler_runs() {
        let job = {
            let mut job = crate::store::testing::sample_job("stolen");
            job.status = JobStatus::Running;
            job.locked_by = Some("w1".to_owned());
            job.lock_until = Some(Utc::now() + TimeDelta::minutes(5));
            job
        };
        let mut mock = MockJobStore::new();
        {
            let job = job.clone();
            let mut acquired = Some(job);
            mock.expect_find_and_lock_next()
                .returning(move |_| Ok(acquired.take()));
        }
        {
            let mut job = job.clone();
            job.locked_by = Some("w2".to_owned());
            mock.expect_find_by_id()
                .returning(move |_| Ok(Some(job.clone())));
        }
        mock.expect_renew_lock()
            .returning(|id, _, _| Err(StoreError::LockLost(id.clone())));

        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            registry.register(
                "stolen",
                handler_fn(move |_job| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        let events = EventBus::new();
        let seen = capture(&events);
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(mock),
            registry,
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let seen = seen.clone();
            run_worker_until(worker, shutdown, move || {
                seen.lock().unwrap().iter().any(|n| n == "worker:error")
            })
            .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0, "handler must not run");
        assert!(count_of(&seen, "worker:error") >= 1);
    }

    #[tokio::test]
    async fn heartbeat_renews_lock_during_long_handler() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();
        registry.register(
            "slow",
            handler_fn(|_job| async {
                tokio::time::sleep(Duration::from_millis(350)).await;
                Ok(())
            }),
        );
        let events = EventBus::new();
        let job = store.create(due_job("slow")).await.unwrap();

        // Tiny lock timeout so the heartbeat must fire several times.
        let mut config = test_config("w1");
        config.lock_timeout = TimeDelta::milliseconds(150);

        let shutdown = CancellationToken::new();
        let worker = Worker::new(store.clone(), registry, events, config, shutdown.clone());
        {
            let store = store.clone();
            let id = job.id.clone();
            run_worker_until(worker, shutdown, move || {
                futures::executor::block_on(store.find_by_id(&id))
                    .unwrap()
                    .is_some_and(|job| job.status == JobStatus::Completed)
            })
            .await;
        }

        let done = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        // Acquisition bumped once; each successful renewal bumped again.
        assert!(
            done.lock_version >= 3,
            "expected heartbeat renewals, lock_version = {}",
            done.lock_version
        );
    }

    #[tokio::test]
    async fn retry_precedes_repeat_after_failure() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();
        registry.register("flaky-repeat", handler_fn(|_job| async { Err("nope".into()) }));
        let events = EventBus::new();
        let seen = capture(&events);

        let mut new_job = due_job("flaky-repeat");
        new_job.retry = Some(crate::retry::RetrySpec::fixed(2, 60_000));
        new_job.repeat = Some(crate::planner::RepeatSpec::every(100));
        let job = store.create(new_job).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            registry,
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let seen = seen.clone();
            run_worker_until(worker, shutdown, move || {
                seen.lock().unwrap().iter().any(|n| n == "job:retry")
            })
            .await;
        }

        let current = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Pending);
        assert_eq!(current.attempts, 1);
        // The retry delay won, not the 100ms repeat interval.
        assert!(current.next_run_at.unwrap() > Utc::now() + TimeDelta::seconds(30));
    }

    #[tokio::test]
    async fn poll_errors_emit_worker_error_and_continue() {
        let mut mock = MockJobStore::new();
        mock.expect_find_and_lock_next()
            .returning(|_| Err(StoreError::Storage("down".to_owned())));

        let events = EventBus::new();
        let seen = capture(&events);
        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            Arc::new(mock),
            HandlerRegistry::new(),
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let seen = seen.clone();
            run_worker_until(worker, shutdown, move || {
                count_of(&seen, "worker:error") >= 2
            })
            .await;
        }

        // The loop survived at least two failed polls and exited cleanly.
        assert_eq!(count_of(&seen, "worker:stop"), 1);
    }

    #[tokio::test]
    async fn interval_job_is_rescheduled_not_completed() {
        let store = MemoryStore::new();
        let registry = HandlerRegistry::new();
        registry.register("tick", handler_fn(|_job| async { Ok(()) }));
        let events = EventBus::new();
        let seen = capture(&events);

        let mut new_job = due_job("tick");
        new_job.repeat = Some(crate::planner::RepeatSpec::every(60_000));
        let job = store.create(new_job).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Worker::new(
            store.clone(),
            registry,
            events,
            test_config("w1"),
            shutdown.clone(),
        );
        {
            let seen = seen.clone();
            run_worker_until(worker, shutdown, move || {
                seen.lock().unwrap().iter().any(|n| n == "job:complete")
            })
            .await;
        }

        let current = store.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Pending, "repeats never complete");
        assert_eq!(current.attempts, 1);
        assert!(current.next_run_at.unwrap() > Utc::now() + TimeDelta::seconds(50));
        assert_eq!(
            store
                .find_all(Query::StatusEqual(JobStatus::Completed))
                .await
                .unwrap()
                .len(),
            0
        );
    }
}
