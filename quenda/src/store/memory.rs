//! In-memory [`JobStore`] implementation.
//!
//! Provided as a correct (but not optimized) implementation for tests and
//! single-process embedding. Conditional writes are emulated with a mutex
//! over the record collection, which makes every operation trivially
//! linearizable; the distributed semantics live in `quenda-mongo`.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{JobStore, LockRequest, Query, StoreError, MAX_NAME_SKIPS};
use crate::job::{Job, JobId, JobStatus, JobUpdate, NewJob, PRIORITY_DEFAULT};
use crate::pruner::{PruneBy, PruneSpec};

/// An in-memory job store.
///
/// Clones share the same record collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> JobId {
        JobId::from(format!("{}", self.id_counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn insert_locked(&self, jobs: &mut Vec<Job>, new_job: NewJob) -> Job {
        let now = Utc::now();
        let job = Job {
            id: self.next_id(),
            name: new_job.name,
            data: new_job.data,
            status: JobStatus::Pending,
            next_run_at: Some(new_job.run_at.unwrap_or(now)),
            last_run_at: None,
            last_scheduled_at: None,
            locked_at: None,
            locked_by: None,
            lock_until: None,
            lock_version: 0,
            attempts: 0,
            last_error: None,
            retry: new_job.retry,
            repeat: new_job.repeat,
            dedupe_key: new_job.dedupe_key,
            priority: new_job.priority.unwrap_or(PRIORITY_DEFAULT),
            concurrency: new_job.concurrency,
            created_at: now,
            updated_at: now,
        };
        jobs.push(job.clone());
        job
    }

    fn clear_lock(job: &mut Job) {
        job.locked_at = None;
        job.locked_by = None;
        job.lock_until = None;
    }

    /// Test hook for staging states the public API cannot produce, such as
    /// legacy records carrying `lockedAt` without `lockUntil`.
    #[cfg(test)]
    pub(crate) fn tweak(&self, id: &JobId, mutate: impl FnOnce(&mut Job)) {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.iter_mut().find(|job| job.id == *id).unwrap();
        mutate(job);
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(key) = &new_job.dedupe_key {
            if let Some(existing) = jobs.iter().find(|job| job.dedupe_key.as_ref() == Some(key)) {
                return Ok(existing.clone());
            }
        }
        Ok(self.insert_locked(&mut jobs, new_job))
    }

    async fn create_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        let mut created = Vec::with_capacity(new_jobs.len());
        for new_job in new_jobs {
            created.push(self.create(new_job).await?);
        }
        Ok(created)
    }

    async fn find_and_lock_next(&self, request: LockRequest) -> Result<Option<Job>, StoreError> {
        let LockRequest {
            now,
            worker_id,
            lock_timeout,
        } = request;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut skipped: Vec<String> = Vec::new();

        while skipped.len() < MAX_NAME_SKIPS {
            let candidate = jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.is_acquirable(now) && !skipped.contains(&job.name))
                .min_by(|(_, a), (_, b)| {
                    a.priority
                        .cmp(&b.priority)
                        .then(a.next_run_at.cmp(&b.next_run_at))
                });
            let Some((index, candidate)) = candidate else {
                return Ok(None);
            };

            if let Some(cap) = candidate.concurrency {
                let running = jobs
                    .iter()
                    .filter(|other| {
                        other.id != candidate.id
                            && other.name == candidate.name
                            && other.status == JobStatus::Running
                    })
                    .count() as u32;
                if running >= cap {
                    skipped.push(jobs[index].name.clone());
                    continue;
                }
            }

            let job = &mut jobs[index];
            job.status = JobStatus::Running;
            job.locked_by = Some(worker_id);
            job.locked_at = Some(now);
            job.lock_until = Some(now + lock_timeout);
            job.last_run_at = Some(now);
            job.lock_version += 1;
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn renew_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_timeout: TimeDelta,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let owned = jobs.iter_mut().find(|job| {
            job.id == *id
                && job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(worker_id)
        });
        match owned {
            None => Err(StoreError::LockLost(id.clone())),
            Some(job) => {
                job.locked_at = Some(now);
                job.lock_until = Some(now + lock_timeout);
                job.lock_version += 1;
                job.updated_at = now;
                Ok(job.clone())
            }
        }
    }

    async fn mark_completed(&self, id: &JobId, worker_id: &str) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == *id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner(id.clone()));
        }
        job.status = JobStatus::Completed;
        Self::clear_lock(job);
        job.lock_version += 1;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == *id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        if job.status != JobStatus::Running || job.locked_by.as_deref() != Some(worker_id) {
            return Err(StoreError::NotOwner(id.clone()));
        }
        job.status = JobStatus::Failed;
        job.last_error = Some(error.to_owned());
        Self::clear_lock(job);
        job.lock_version += 1;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reschedule(
        &self,
        id: &JobId,
        next_run_at: DateTime<Utc>,
        attempts: Option<u32>,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == *id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        job.status = JobStatus::Pending;
        job.next_run_at = Some(next_run_at);
        job.last_scheduled_at = Some(next_run_at);
        job.attempts = attempts.unwrap_or(job.attempts + 1);
        Self::clear_lock(job);
        job.lock_version += 1;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn recover_stale_jobs(
        &self,
        now: DateTime<Utc>,
        lock_timeout: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let cutoff = now - lock_timeout;
        let mut recovered = 0;
        for job in jobs.iter_mut() {
            let stale = match (job.lock_until, job.locked_at) {
                (Some(until), _) => until <= now,
                (None, Some(at)) => at <= cutoff,
                (None, None) => false,
            };
            if stale {
                job.status = JobStatus::Pending;
                Self::clear_lock(job);
                job.lock_version += 1;
                job.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn cancel(&self, id: &JobId) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == *id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        job.status = JobStatus::Cancelled;
        Self::clear_lock(job);
        job.lock_version += 1;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().find(|job| job.id == *id).cloned())
    }

    async fn find_all<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().filter(|job| query.matches(job)).cloned().collect())
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == *id) else {
            return Err(StoreError::JobNotFound(id.clone()));
        };
        if let Some(data) = update.data {
            job.data = data;
        }
        if let Some(priority) = update.priority {
            job.priority = priority;
        }
        if let Some(attempts) = update.attempts {
            job.attempts = job.attempts.max(attempts);
        }
        if let Some(retry) = update.retry {
            job.retry = Some(retry);
        }
        if let Some(repeat) = update.repeat {
            job.repeat = Some(repeat);
        }
        if let Some(concurrency) = update.concurrency {
            job.concurrency = Some(concurrency);
        }
        if let Some(next_run_at) = update.next_run_at {
            job.next_run_at = Some(next_run_at);
            job.status = JobStatus::Pending;
            Self::clear_lock(job);
            job.lock_version += 1;
        }
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn count_running(&self, name: &str) -> Result<u64, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter()
            .filter(|job| job.name == name && job.status == JobStatus::Running)
            .count() as u64)
    }

    async fn prune_jobs(&self, spec: &PruneSpec) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        match spec.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = Utc::now() - age;
                jobs.retain(|job| !spec.matches(job) || job.updated_at > cutoff);
            }
            PruneBy::MaxCount(keep) => {
                let mut matching: Vec<(DateTime<Utc>, JobId)> = jobs
                    .iter()
                    .filter(|job| spec.matches(job))
                    .map(|job| (job.updated_at, job.id.clone()))
                    .collect();
                matching.sort_by(|a, b| b.0.cmp(&a.0));
                let doomed: Vec<JobId> = matching
                    .into_iter()
                    .skip(keep as usize)
                    .map(|(_, id)| id)
                    .collect();
                jobs.retain(|job| !doomed.contains(&job.id));
            }
        }
        Ok((before - jobs.len()) as u64)
    }
}
