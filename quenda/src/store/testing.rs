//! Behavior contract for [`JobStore`](super::JobStore) implementations.
//!
//! Every store must be observably equivalent on these operations. Run the
//! whole suite against an implementation with [`store_test_suite!`]:
//!
//! ```
//! # use quenda::store::memory::MemoryStore;
//! use quenda::store_test_suite;
//! store_test_suite!(for: MemoryStore::new());
//! ```
//!
//! For a backend needing live infrastructure, the suite can be stamped out
//! ignored-by-default:
//!
//! ```ignore
//! store_test_suite!(
//!     attr: tokio::test,
//!     ignore: "requires a running MongoDB",
//!     store: connect_test_store().await
//! );
//! ```
//!
//! [`store_test_suite!`]: crate::store_test_suite

use chrono::{DateTime, TimeDelta, Utc};

use super::{JobStore, LockRequest, Query, StoreError};
use crate::job::{Job, JobId, JobStatus, JobUpdate, NewJob, PRIORITY_DEFAULT};
use crate::pruner::{PruneSpec, Pruner};
use crate::retry::RetrySpec;

/// Tolerance for instants that round-trip through millisecond-precision
/// storage.
const DELTA: TimeDelta = TimeDelta::milliseconds(2);

const WORKER: &str = "test-worker-1";
const OTHER_WORKER: &str = "test-worker-2";

fn lock_timeout() -> TimeDelta {
    TimeDelta::minutes(5)
}

fn close(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).abs() < DELTA
}

/// A submission due immediately.
pub fn due_job(name: &str) -> NewJob {
    let mut new_job = NewJob::new(name);
    new_job.run_at = Some(Utc::now() - TimeDelta::seconds(1));
    new_job
}

/// A pending job record for unit tests that never touch a store.
pub fn sample_job(name: &str) -> Job {
    let now = Utc::now();
    Job {
        id: JobId::from("sample-1"),
        name: name.to_owned(),
        data: serde_json::Value::Null,
        status: JobStatus::Pending,
        next_run_at: Some(now),
        last_run_at: None,
        last_scheduled_at: None,
        locked_at: None,
        locked_by: None,
        lock_until: None,
        lock_version: 0,
        attempts: 0,
        last_error: None,
        retry: None,
        repeat: None,
        dedupe_key: None,
        priority: PRIORITY_DEFAULT,
        concurrency: None,
        created_at: now,
        updated_at: now,
    }
}

/// Acquires the next due job as `worker`, with the default test lease.
pub async fn lock_next(store: &impl JobStore, worker: &str) -> Option<Job> {
    lock_next_at(store, worker, Utc::now(), lock_timeout()).await
}

/// Acquires with an explicit clock, for staging stale-lock states.
pub async fn lock_next_at(
    store: &impl JobStore,
    worker: &str,
    now: DateTime<Utc>,
    lock_timeout: TimeDelta,
) -> Option<Job> {
    store
        .find_and_lock_next(LockRequest {
            now,
            worker_id: worker.to_owned(),
            lock_timeout,
        })
        .await
        .expect("find_and_lock_next failed")
}

#[doc(hidden)]
pub async fn create_applies_defaults(store: impl JobStore) {
    let before = Utc::now();
    let job = store.create(NewJob::new("defaults")).await.unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, PRIORITY_DEFAULT);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.lock_version, 0);
    assert!(job.locked_by.is_none());
    assert!(job.lock_until.is_none());
    assert!(job.locked_at.is_none());
    let next_run_at = job.next_run_at.expect("defaults to now");
    assert!(next_run_at >= before - DELTA);
    assert!(next_run_at <= Utc::now() + DELTA);
    assert!(close(job.created_at, job.updated_at));

    let found = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(found.id, job.id);
}

#[doc(hidden)]
pub async fn create_uses_explicit_run_at(store: impl JobStore) {
    let run_at = Utc::now() + TimeDelta::hours(2);
    let mut new_job = NewJob::new("later");
    new_job.run_at = Some(run_at);
    new_job.priority = Some(2);

    let job = store.create(new_job).await.unwrap();
    assert!(close(job.next_run_at.unwrap(), run_at));
    assert_eq!(job.priority, 2);
}

#[doc(hidden)]
pub async fn create_dedupe_returns_existing_record(store: impl JobStore) {
    let mut first = due_job("dedupe");
    first.dedupe_key = Some("k".to_owned());
    let mut second = due_job("dedupe");
    second.dedupe_key = Some("k".to_owned());
    second.priority = Some(1);

    let a = store.create(first).await.unwrap();
    let b = store.create(second).await.unwrap();

    assert_eq!(a.id, b.id);
    // The existing record is returned unchanged.
    assert_eq!(b.priority, PRIORITY_DEFAULT);
    let matching = store
        .find_all(Query::DedupeKeyEqual("k"))
        .await
        .unwrap();
    assert_eq!(matching.len(), 1);
}

#[doc(hidden)]
pub async fn create_bulk_assigns_distinct_ids(store: impl JobStore) {
    let mut keyed = due_job("bulk");
    keyed.dedupe_key = Some("bulk-k".to_owned());
    let mut duplicate = due_job("bulk");
    duplicate.dedupe_key = Some("bulk-k".to_owned());

    let created = store
        .create_bulk(vec![due_job("bulk"), due_job("bulk"), keyed, duplicate])
        .await
        .unwrap();

    assert_eq!(created.len(), 4);
    assert_ne!(created[0].id, created[1].id);
    // Dedupe applies per record, also within one batch.
    assert_eq!(created[2].id, created[3].id);
    let stored = store.find_all(Query::NameEqual("bulk")).await.unwrap();
    assert_eq!(stored.len(), 3);
}

#[doc(hidden)]
pub async fn lock_next_returns_none_when_store_empty(store: impl JobStore) {
    assert!(lock_next(&store, WORKER).await.is_none());
}

#[doc(hidden)]
pub async fn lock_next_skips_jobs_not_yet_due(store: impl JobStore) {
    let mut new_job = NewJob::new("future");
    new_job.run_at = Some(Utc::now() + TimeDelta::hours(1));
    store.create(new_job).await.unwrap();

    assert!(lock_next(&store, WORKER).await.is_none());
}

#[doc(hidden)]
pub async fn lock_next_mutates_lock_fields(store: impl JobStore) {
    let created = store.create(due_job("work")).await.unwrap();
    let now = Utc::now();

    let job = lock_next_at(&store, WORKER, now, lock_timeout())
        .await
        .expect("due job should be acquired");

    assert_eq!(job.id, created.id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some(WORKER));
    assert!(close(job.locked_at.unwrap(), now));
    assert!(close(job.lock_until.unwrap(), now + lock_timeout()));
    assert!(close(job.last_run_at.unwrap(), now));
    assert!(job.lock_version > created.lock_version);
}

#[doc(hidden)]
pub async fn lock_next_prefers_lower_priority_then_earlier_run_at(store: impl JobStore) {
    let run_at = Utc::now() - TimeDelta::seconds(5);
    let mut by_priority = Vec::new();
    for priority in [10u8, 1, 5] {
        let mut new_job = NewJob::new("ordered");
        new_job.run_at = Some(run_at);
        new_job.priority = Some(priority);
        by_priority.push((priority, store.create(new_job).await.unwrap().id));
    }
    let mut earlier = NewJob::new("ordered");
    earlier.run_at = Some(run_at - TimeDelta::seconds(10));
    earlier.priority = Some(5);
    let earlier = store.create(earlier).await.unwrap();

    let find = |priority: u8| {
        by_priority
            .iter()
            .find(|(p, _)| *p == priority)
            .unwrap()
            .1
            .clone()
    };
    let order: Vec<JobId> = [
        lock_next(&store, WORKER).await.unwrap().id,
        lock_next(&store, WORKER).await.unwrap().id,
        lock_next(&store, WORKER).await.unwrap().id,
        lock_next(&store, WORKER).await.unwrap().id,
    ]
    .to_vec();

    // Priority 1 first, then the two priority-5 jobs earliest-first, then 10.
    assert_eq!(order, vec![find(1), earlier.id, find(5), find(10)]);
}

#[doc(hidden)]
pub async fn lock_next_does_not_return_same_job_twice(store: impl JobStore) {
    store.create(due_job("single")).await.unwrap();

    assert!(lock_next(&store, WORKER).await.is_some());
    assert!(lock_next(&store, OTHER_WORKER).await.is_none());
}

#[doc(hidden)]
pub async fn lock_next_reclaims_stale_lock(store: impl JobStore) {
    store.create(due_job("stale")).await.unwrap();

    // First worker acquired long ago and its lease has expired.
    let past = Utc::now() - TimeDelta::minutes(30);
    let stale = lock_next_at(&store, WORKER, past, TimeDelta::minutes(1))
        .await
        .unwrap();

    let reclaimed = lock_next(&store, OTHER_WORKER).await.unwrap();
    assert_eq!(reclaimed.id, stale.id);
    assert_eq!(reclaimed.locked_by.as_deref(), Some(OTHER_WORKER));
    assert!(reclaimed.lock_version > stale.lock_version);
}

#[doc(hidden)]
pub async fn stolen_lock_fails_ownership_checks(store: impl JobStore) {
    store.create(due_job("steal")).await.unwrap();
    let past = Utc::now() - TimeDelta::minutes(30);
    let job = lock_next_at(&store, WORKER, past, TimeDelta::minutes(1))
        .await
        .unwrap();

    let recovered = store
        .recover_stale_jobs(Utc::now(), TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let stolen = lock_next(&store, OTHER_WORKER).await.unwrap();
    assert_eq!(stolen.id, job.id);

    // The original owner's completion is rejected and changes nothing.
    let err = store.mark_completed(&job.id, WORKER).await.unwrap_err();
    assert!(matches!(err, StoreError::NotOwner(_)));

    let current = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert_eq!(current.locked_by.as_deref(), Some(OTHER_WORKER));
}

#[doc(hidden)]
pub async fn concurrency_cap_blocks_acquisition_at_limit(store: impl JobStore) {
    for _ in 0..3 {
        let mut new_job = due_job("rate-limited");
        new_job.concurrency = Some(2);
        store.create(new_job).await.unwrap();
    }

    let first = lock_next(&store, "w1").await;
    let second = lock_next(&store, "w2").await;
    let third = lock_next(&store, "w3").await;

    assert!(first.is_some());
    assert!(second.is_some());
    assert!(third.is_none(), "cap of 2 must block the third acquisition");
    assert_eq!(store.count_running("rate-limited").await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn concurrency_cap_skips_to_other_eligible_names(store: impl JobStore) {
    let mut capped = due_job("capped");
    capped.concurrency = Some(1);
    capped.priority = Some(1);
    store.create(capped.clone()).await.unwrap();
    store.create(capped).await.unwrap();
    let mut other = due_job("uncapped");
    other.priority = Some(9);
    let other = store.create(other).await.unwrap();

    // First call takes a capped job; the second must skip the capped name
    // despite its better priority and land on the other name.
    let first = lock_next(&store, "w1").await.unwrap();
    assert_eq!(first.name, "capped");
    let second = lock_next(&store, "w2").await.unwrap();
    assert_eq!(second.id, other.id);
}

#[doc(hidden)]
pub async fn renew_lock_extends_lease(store: impl JobStore) {
    store.create(due_job("renew")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let renewed = store
        .renew_lock(&job.id, WORKER, TimeDelta::minutes(30))
        .await
        .unwrap();

    assert!(renewed.lock_until.unwrap() > job.lock_until.unwrap());
    assert!(renewed.lock_version > job.lock_version);
    assert_eq!(renewed.status, JobStatus::Running);
}

#[doc(hidden)]
pub async fn renew_lock_fails_for_non_owner(store: impl JobStore) {
    store.create(due_job("renew")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let err = store
        .renew_lock(&job.id, OTHER_WORKER, lock_timeout())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockLost(_)));
}

#[doc(hidden)]
pub async fn renew_lock_fails_when_not_running(store: impl JobStore) {
    store.create(due_job("renew")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();
    store.mark_completed(&job.id, WORKER).await.unwrap();

    let err = store
        .renew_lock(&job.id, WORKER, lock_timeout())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockLost(_)));
}

#[doc(hidden)]
pub async fn mark_completed_clears_lock(store: impl JobStore) {
    store.create(due_job("finish")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let done = store.mark_completed(&job.id, WORKER).await.unwrap();

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.locked_by.is_none());
    assert!(done.locked_at.is_none());
    assert!(done.lock_until.is_none());
    assert!(done.lock_version > job.lock_version);
}

#[doc(hidden)]
pub async fn mark_completed_requires_ownership(store: impl JobStore) {
    store.create(due_job("finish")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let err = store
        .mark_completed(&job.id, OTHER_WORKER)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotOwner(_)));

    let current = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert_eq!(current.locked_by.as_deref(), Some(WORKER));
}

#[doc(hidden)]
pub async fn mark_failed_records_error_and_requires_ownership(store: impl JobStore) {
    store.create(due_job("explode")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let err = store
        .mark_failed(&job.id, OTHER_WORKER, "not yours")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotOwner(_)));

    let failed = store
        .mark_failed(&job.id, WORKER, "boom")
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("boom"));
    assert!(failed.locked_by.is_none());
    assert!(failed.lock_until.is_none());
}

#[doc(hidden)]
pub async fn reschedule_returns_job_to_pending(store: impl JobStore) {
    store.create(due_job("repeat")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();
    let next_run_at = Utc::now() + TimeDelta::minutes(10);

    let rescheduled = store.reschedule(&job.id, next_run_at, None).await.unwrap();

    assert_eq!(rescheduled.status, JobStatus::Pending);
    assert!(close(rescheduled.next_run_at.unwrap(), next_run_at));
    assert!(close(rescheduled.last_scheduled_at.unwrap(), next_run_at));
    assert_eq!(rescheduled.attempts, job.attempts + 1);
    assert!(rescheduled.locked_by.is_none());
    assert!(rescheduled.lock_until.is_none());
    assert!(rescheduled.lock_version > job.lock_version);
}

#[doc(hidden)]
pub async fn reschedule_sets_explicit_attempts(store: impl JobStore) {
    store.create(due_job("retrying")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let rescheduled = store
        .reschedule(&job.id, Utc::now() + TimeDelta::seconds(30), Some(7))
        .await
        .unwrap();
    assert_eq!(rescheduled.attempts, 7);
}

#[doc(hidden)]
pub async fn recover_stale_jobs_is_idempotent(store: impl JobStore) {
    store.create(due_job("stale-a")).await.unwrap();
    store.create(due_job("stale-b")).await.unwrap();
    let past = Utc::now() - TimeDelta::minutes(30);
    lock_next_at(&store, WORKER, past, TimeDelta::minutes(1)).await;
    lock_next_at(&store, WORKER, past, TimeDelta::minutes(1)).await;

    let now = Utc::now();
    let first = store
        .recover_stale_jobs(now, TimeDelta::minutes(1))
        .await
        .unwrap();
    let second = store
        .recover_stale_jobs(now, TimeDelta::minutes(1))
        .await
        .unwrap();

    assert_eq!(first, 2);
    assert_eq!(second, 0);

    let pending = store
        .find_all(Query::StatusEqual(JobStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|job| job.locked_by.is_none()));
}

#[doc(hidden)]
pub async fn recover_ignores_live_locks(store: impl JobStore) {
    store.create(due_job("alive")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();

    let recovered = store
        .recover_stale_jobs(Utc::now(), TimeDelta::minutes(1))
        .await
        .unwrap();

    assert_eq!(recovered, 0);
    let current = store.find_by_id(&job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert_eq!(current.locked_by.as_deref(), Some(WORKER));
}

#[doc(hidden)]
pub async fn cancel_applies_to_any_state(store: impl JobStore) {
    let pending = store.create(due_job("doomed")).await.unwrap();
    let cancelled = store.cancel(&pending.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    store.create(due_job("doomed-running")).await.unwrap();
    let running = lock_next(&store, WORKER).await.unwrap();
    let cancelled = store.cancel(&running.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.locked_by.is_none());
    assert!(cancelled.lock_until.is_none());
}

#[doc(hidden)]
pub async fn update_resets_status_on_next_run_at(store: impl JobStore) {
    store.create(due_job("revive")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();
    store.mark_failed(&job.id, WORKER, "gave up").await.unwrap();

    let next_run_at = Utc::now() + TimeDelta::minutes(1);
    let revived = store
        .update(
            &job.id,
            JobUpdate {
                next_run_at: Some(next_run_at),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(revived.status, JobStatus::Pending);
    assert!(close(revived.next_run_at.unwrap(), next_run_at));
    assert!(revived.locked_by.is_none());
}

#[doc(hidden)]
pub async fn update_clamps_attempts_monotone(store: impl JobStore) {
    store.create(due_job("count")).await.unwrap();
    let job = lock_next(&store, WORKER).await.unwrap();
    store
        .reschedule(&job.id, Utc::now(), Some(5))
        .await
        .unwrap();

    let updated = store
        .update(
            &job.id,
            JobUpdate {
                attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.attempts, 5, "attempts never decrease");

    let updated = store
        .update(
            &job.id,
            JobUpdate {
                attempts: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.attempts, 9);
}

#[doc(hidden)]
pub async fn update_changes_payload_fields(store: impl JobStore) {
    let job = store.create(due_job("edit")).await.unwrap();

    let updated = store
        .update(
            &job.id,
            JobUpdate {
                data: Some(serde_json::json!({"n": 2})),
                priority: Some(1),
                retry: Some(RetrySpec::fixed(4, 100)),
                concurrency: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.data, serde_json::json!({"n": 2}));
    assert_eq!(updated.priority, 1);
    assert_eq!(updated.retry, Some(RetrySpec::fixed(4, 100)));
    assert_eq!(updated.concurrency, Some(3));
    // No lifecycle side effects without a next_run_at reset.
    assert_eq!(updated.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn count_running_scoped_by_name(store: impl JobStore) {
    store.create(due_job("a")).await.unwrap();
    store.create(due_job("a")).await.unwrap();
    store.create(due_job("b")).await.unwrap();
    lock_next(&store, "w1").await.unwrap();
    lock_next(&store, "w2").await.unwrap();
    lock_next(&store, "w3").await.unwrap();

    assert_eq!(store.count_running("a").await.unwrap(), 2);
    assert_eq!(store.count_running("b").await.unwrap(), 1);
    assert_eq!(store.count_running("c").await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn find_all_supports_combinators(store: impl JobStore) {
    let a = store.create(due_job("alpha")).await.unwrap();
    store.create(due_job("beta")).await.unwrap();
    let mut later = NewJob::new("beta");
    later.run_at = Some(Utc::now() + TimeDelta::hours(1));
    store.create(later).await.unwrap();

    assert_eq!(store.find_all(Query::All).await.unwrap().len(), 3);
    assert_eq!(
        store.find_all(Query::NameEqual("beta")).await.unwrap().len(),
        2
    );
    assert_eq!(
        store
            .find_all(Query::And(vec![
                Query::NameEqual("beta"),
                Query::RunnableBefore(Utc::now()),
            ]))
            .await
            .unwrap()
            .len(),
        1
    );
    let ids = [a.id.clone()];
    let by_id = store.find_all(Query::IdIn(&ids)).await.unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].id, a.id);
    assert_eq!(
        store
            .find_all(Query::StatusIn(&[JobStatus::Pending, JobStatus::Running]))
            .await
            .unwrap()
            .len(),
        3
    );
}

async fn finish_one(store: &impl JobStore, name: &str) -> Job {
    let job = store.create(due_job(name)).await.unwrap();
    let locked = lock_next(store, WORKER).await.unwrap();
    assert_eq!(locked.id, job.id, "staging expects one due job at a time");
    store.mark_completed(&job.id, WORKER).await.unwrap()
}

#[doc(hidden)]
pub async fn prune_by_age_removes_old_finished_jobs(store: impl JobStore) {
    finish_one(&store, "report").await;
    finish_one(&store, "report").await;
    finish_one(&store, "audit").await;
    let pending = store.create(due_job("report")).await.unwrap();

    // Fresh records survive a generous age limit.
    let lenient: PruneSpec = Pruner::max_age(TimeDelta::hours(1), JobStatus::Completed).into();
    assert_eq!(store.prune_jobs(&lenient).await.unwrap(), 0);

    let spec: PruneSpec = Pruner::max_age(TimeDelta::zero(), JobStatus::Completed)
        .only("report")
        .into();
    assert_eq!(store.prune_jobs(&spec).await.unwrap(), 2);

    let remaining = store.find_all(Query::All).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().any(|job| job.id == pending.id));
    assert!(remaining
        .iter()
        .any(|job| job.name == "audit" && job.status == JobStatus::Completed));
}

#[doc(hidden)]
pub async fn prune_by_count_keeps_newest_records(store: impl JobStore) {
    for _ in 0..5 {
        finish_one(&store, "log").await;
    }

    let spec: PruneSpec = Pruner::max_count(2, JobStatus::Completed).into();
    assert_eq!(store.prune_jobs(&spec).await.unwrap(), 3);
    assert_eq!(
        store
            .find_all(Query::StatusEqual(JobStatus::Completed))
            .await
            .unwrap()
            .len(),
        2
    );

    // Already at the limit: nothing more to remove.
    assert_eq!(store.prune_jobs(&spec).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn prune_respects_name_filters(store: impl JobStore) {
    finish_one(&store, "keep-me").await;
    finish_one(&store, "drop-me").await;

    let spec: PruneSpec = Pruner::max_age(TimeDelta::zero(), JobStatus::Completed)
        .except("keep-me")
        .into();
    assert_eq!(store.prune_jobs(&spec).await.unwrap(), 1);

    let remaining = store.find_all(Query::All).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "keep-me");
}

#[doc(hidden)]
pub async fn lock_version_is_monotone_across_lifecycle(store: impl JobStore) {
    store.create(due_job("versioned")).await.unwrap();

    let mut last = 0u64;
    let job = lock_next(&store, WORKER).await.unwrap();
    assert!(job.lock_version > last);
    last = job.lock_version;

    let renewed = store
        .renew_lock(&job.id, WORKER, lock_timeout())
        .await
        .unwrap();
    assert!(renewed.lock_version > last);
    last = renewed.lock_version;

    let rescheduled = store
        .reschedule(&job.id, Utc::now() - TimeDelta::seconds(1), None)
        .await
        .unwrap();
    assert!(rescheduled.lock_version > last);
    last = rescheduled.lock_version;

    let reacquired = lock_next(&store, OTHER_WORKER).await.unwrap();
    assert_eq!(reacquired.id, job.id);
    assert!(reacquired.lock_version > last);
    last = reacquired.lock_version;

    let done = store
        .mark_completed(&job.id, OTHER_WORKER)
        .await
        .unwrap();
    assert!(done.lock_version > last);
}

/// Stamps out the full store contract suite against one implementation.
///
/// `$store` is evaluated inside each generated async test, so it may await.
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, store: $store);
    };
    (attr: $attr:meta, store: $store:expr) => {
        $crate::store_test_suite!(@all { #[$attr] }, $store);
    };
    (attr: $attr:meta, ignore: $reason:literal, store: $store:expr) => {
        $crate::store_test_suite!(@all { #[$attr] #[ignore = $reason] }, $store);
    };
    (@all $attrs:tt, $store:expr) => {
        $crate::store_test_suite!(@cases $attrs, $store,
            create_applies_defaults,
            create_uses_explicit_run_at,
            create_dedupe_returns_existing_record,
            create_bulk_assigns_distinct_ids,
            lock_next_returns_none_when_store_empty,
            lock_next_skips_jobs_not_yet_due,
            lock_next_mutates_lock_fields,
            lock_next_prefers_lower_priority_then_earlier_run_at,
            lock_next_does_not_return_same_job_twice,
            lock_next_reclaims_stale_lock,
            stolen_lock_fails_ownership_checks,
            concurrency_cap_blocks_acquisition_at_limit,
            concurrency_cap_skips_to_other_eligible_names,
            renew_lock_extends_lease,
            renew_lock_fails_for_non_owner,
            renew_lock_fails_when_not_running,
            mark_completed_clears_lock,
            mark_completed_requires_ownership,
            mark_failed_records_error_and_requires_ownership,
            reschedule_returns_job_to_pending,
            reschedule_sets_explicit_attempts,
            recover_stale_jobs_is_idempotent,
            recover_ignores_live_locks,
            cancel_applies_to_any_state,
            update_resets_status_on_next_run_at,
            update_clamps_attempts_monotone,
            update_changes_payload_fields,
            count_running_scoped_by_name,
            find_all_supports_combinators,
            prune_by_age_removes_old_finished_jobs,
            prune_by_count_keeps_newest_records,
            prune_respects_name_filters,
            lock_version_is_monotone_across_lifecycle,
        );
    };
    (@cases $attrs:tt, $store:expr, $($name:ident),+ $(,)?) => {
        $(
            $crate::store_test_suite!(@one $attrs, $store, $name);
        )+
    };
    (@one { $($attrs:tt)* }, $store:expr, $name:ident) => {
        $($attrs)*
        async fn $name() {
            let store = $store;
            $crate::store::testing::$name(store).await;
        }
    };
}

pub use store_test_suite;
