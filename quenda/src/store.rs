//! The persistence seam every scheduler component goes through.
//!
//! [`JobStore`] encapsulates all concurrency-critical persistence. Each
//! mutating operation touches exactly one record and is linearizable against
//! other mutations of that record; [`JobStore::find_and_lock_next`] is the
//! only find-and-modify that must be atomic across the record set. Every
//! state-dependent transition (renewal, completion, failure) is a conditional
//! write matching `lockedBy` and `status` — the ownership check that keeps a
//! CPU-starved worker whose lock was reclaimed from corrupting state.
//!
//! Two implementations ship: [`memory::MemoryStore`] for tests and
//! single-process embedding, and the MongoDB store in the `quenda-mongo`
//! crate. Both must be observably equivalent; the shared suite in
//! [`testing`] is the contract.

use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus, JobUpdate, NewJob};
use crate::pruner::PruneSpec;

pub mod memory;
pub mod testing;

/// Parameters for one acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// The acquiring worker's view of "now"; eligibility and lock expiry are
    /// evaluated against it.
    pub now: DateTime<Utc>,
    pub worker_id: String,
    /// Initial lock duration; the heartbeat extends it.
    pub lock_timeout: TimeDelta,
}

/// Upper bound on distinct concurrency-capped names skipped during a single
/// [`JobStore::find_and_lock_next`] call.
pub const MAX_NAME_SKIPS: usize = 20;

/// Record-set filter for [`JobStore::find_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum Query<'a> {
    All,
    And(Vec<Query<'a>>),
    NameEqual(&'a str),
    StatusEqual(JobStatus),
    StatusIn(&'a [JobStatus]),
    DedupeKeyEqual(&'a str),
    /// Jobs whose `nextRunAt` is at or before the given instant.
    RunnableBefore(DateTime<Utc>),
    IdIn(&'a [JobId]),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    /// A lock renewal found the lock no longer held (reclaimed or finished).
    #[error("lock on job {0} is no longer held")]
    LockLost(JobId),
    /// An ownership-checked write found the record owned by someone else.
    #[error("job {0} is not owned by the requesting worker")]
    NotOwner(JobId),
    #[error("error encoding or decoding job data: {0}")]
    Serde(String),
    /// Transport-level failure talking to the backing store.
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("store is in a bad state")]
    BadState,
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serde(err.to_string())
    }
}

/// Durable per-job persistence with atomic compare-and-set transitions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore {
    /// Inserts a job with submission defaults applied (`priority` 5,
    /// `attempts` 0, `status` pending, `lockVersion` 0).
    ///
    /// If `dedupe_key` is set and a record with the same value exists, the
    /// existing record is returned unchanged.
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError>;

    /// Inserts a batch, atomically per record, dedupe semantics per record.
    async fn create_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError>;

    /// Atomically selects and locks at most one eligible job.
    ///
    /// A job is eligible when it is due (`nextRunAt <= now`) and either
    /// pending without an active lock, or running with an expired lock
    /// (stale, reclaimable). Candidates are taken smallest `priority` first,
    /// then smallest `nextRunAt`. A candidate whose name is at its
    /// concurrency cap is skipped and the next-best name is tried, for at
    /// most [`MAX_NAME_SKIPS`] distinct names.
    ///
    /// No two concurrent calls may return the same record.
    async fn find_and_lock_next(&self, request: LockRequest) -> Result<Option<Job>, StoreError>;

    /// Extends the lock lease by `lock_timeout` from now.
    ///
    /// Matches only while `locked_by == worker_id` and the job is running;
    /// otherwise fails with [`StoreError::LockLost`].
    async fn renew_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_timeout: TimeDelta,
    ) -> Result<Job, StoreError>;

    /// Completes the job, clearing the lock.
    ///
    /// Matches only while `locked_by == worker_id` and the job is running;
    /// otherwise fails with [`StoreError::NotOwner`].
    async fn mark_completed(&self, id: &JobId, worker_id: &str) -> Result<Job, StoreError>;

    /// Fails the job terminally, recording `error` as `lastError`.
    ///
    /// Carries the same ownership guard as [`JobStore::mark_completed`].
    async fn mark_failed(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<Job, StoreError>;

    /// Returns the job to `pending` with a new `nextRunAt`, clearing the
    /// lock and recording the instant as `lastScheduledAt`.
    ///
    /// `attempts` is written verbatim when provided, otherwise incremented
    /// by one.
    async fn reschedule(
        &self,
        id: &JobId,
        next_run_at: DateTime<Utc>,
        attempts: Option<u32>,
    ) -> Result<Job, StoreError>;

    /// Releases every abandoned lock: records whose `lockUntil` has passed,
    /// or which have a `lockedAt` older than `now - lock_timeout` and no
    /// recorded `lockUntil`. Returns the number of records released.
    ///
    /// Idempotent and safe to run concurrently with active workers.
    async fn recover_stale_jobs(
        &self,
        now: DateTime<Utc>,
        lock_timeout: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Cancels the job regardless of its current state, clearing any lock.
    async fn cancel(&self, id: &JobId) -> Result<Job, StoreError>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    async fn find_all<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError>;

    /// Applies a restricted update. Setting `next_run_at` implicitly returns
    /// the job to `pending` and clears any lock; `attempts` never decreases.
    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError>;

    /// Number of jobs with the given name currently `running`.
    async fn count_running(&self, name: &str) -> Result<u64, StoreError>;

    /// Removes finished records per the retention rule. Returns the number
    /// deleted.
    async fn prune_jobs(&self, spec: &PruneSpec) -> Result<u64, StoreError>;
}

#[async_trait]
impl<T, S> JobStore for S
where
    T: JobStore + Send + Sync,
    S: Deref<Target = T> + Send + Sync,
{
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        self.deref().create(new_job).await
    }

    async fn create_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        self.deref().create_bulk(new_jobs).await
    }

    async fn find_and_lock_next(&self, request: LockRequest) -> Result<Option<Job>, StoreError> {
        self.deref().find_and_lock_next(request).await
    }

    async fn renew_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_timeout: TimeDelta,
    ) -> Result<Job, StoreError> {
        self.deref().renew_lock(id, worker_id, lock_timeout).await
    }

    async fn mark_completed(&self, id: &JobId, worker_id: &str) -> Result<Job, StoreError> {
        self.deref().mark_completed(id, worker_id).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<Job, StoreError> {
        self.deref().mark_failed(id, worker_id, error).await
    }

    async fn reschedule(
        &self,
        id: &JobId,
        next_run_at: DateTime<Utc>,
        attempts: Option<u32>,
    ) -> Result<Job, StoreError> {
        self.deref().reschedule(id, next_run_at, attempts).await
    }

    async fn recover_stale_jobs(
        &self,
        now: DateTime<Utc>,
        lock_timeout: TimeDelta,
    ) -> Result<u64, StoreError> {
        self.deref().recover_stale_jobs(now, lock_timeout).await
    }

    async fn cancel(&self, id: &JobId) -> Result<Job, StoreError> {
        self.deref().cancel(id).await
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        self.deref().find_by_id(id).await
    }

    async fn find_all<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError> {
        self.deref().find_all(query).await
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError> {
        self.deref().update(id, update).await
    }

    async fn count_running(&self, name: &str) -> Result<u64, StoreError> {
        self.deref().count_running(name).await
    }

    async fn prune_jobs(&self, spec: &PruneSpec) -> Result<u64, StoreError> {
        self.deref().prune_jobs(spec).await
    }
}

impl<'a> Query<'a> {
    /// True when `job` satisfies the filter. Store implementations without a
    /// native query language evaluate with this.
    pub fn matches(&self, job: &Job) -> bool {
        match self {
            Self::All => true,
            Self::And(queries) => queries.iter().all(|query| query.matches(job)),
            Self::NameEqual(name) => job.name == *name,
            Self::StatusEqual(status) => job.status == *status,
            Self::StatusIn(statuses) => statuses.contains(&job.status),
            Self::DedupeKeyEqual(key) => job.dedupe_key.as_deref() == Some(*key),
            Self::RunnableBefore(instant) => job.next_run_at.is_some_and(|at| at <= *instant),
            Self::IdIn(ids) => ids.contains(&job.id),
        }
    }
}
