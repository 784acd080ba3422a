//! The [`JobStore`] trait implementation over conditional MongoDB writes.

use async_trait::async_trait;
use chrono::{DateTime as ChronoDateTime, TimeDelta, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, ReturnDocument};

use quenda::job::{Job, JobId, JobStatus, JobUpdate, NewJob};
use quenda::pruner::{PruneBy, PruneSpec, Spec};
use quenda::store::{JobStore, LockRequest, Query, StoreError, MAX_NAME_SKIPS};

use crate::document::JobDocument;
use crate::{is_duplicate_key, map_err, MongoStore};

fn object_id(id: &JobId) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(id.as_str()).map_err(|_| StoreError::JobNotFound(id.clone()))
}

fn bson_time(at: ChronoDateTime<Utc>) -> DateTime {
    DateTime::from_chrono(at)
}

// Lock fields are removed, not nulled, when a lock is released; the record
// layout requires them absent outside `running`.
fn unset_lock() -> Document {
    doc! { "lockedBy": "", "lockedAt": "", "lockUntil": "" }
}

fn returning_after() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

fn query_filter(query: &Query<'_>) -> Document {
    match query {
        Query::All => doc! {},
        Query::And(queries) => {
            if queries.is_empty() {
                doc! {}
            } else {
                doc! { "$and": queries.iter().map(query_filter).collect::<Vec<_>>() }
            }
        }
        Query::NameEqual(name) => doc! { "name": *name },
        Query::StatusEqual(status) => doc! { "status": status.as_str() },
        Query::StatusIn(statuses) => doc! {
            "status": { "$in": statuses.iter().map(JobStatus::as_str).collect::<Vec<_>>() }
        },
        Query::DedupeKeyEqual(key) => doc! { "dedupeKey": *key },
        Query::RunnableBefore(at) => doc! { "nextRunAt": { "$lte": bson_time(*at) } },
        Query::IdIn(ids) => {
            let ids: Vec<ObjectId> = ids
                .iter()
                .filter_map(|id| ObjectId::parse_str(id.as_str()).ok())
                .collect();
            doc! { "_id": { "$in": ids } }
        }
    }
}

impl MongoStore {
    async fn find_existing_by_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.collection()
            .find_one(doc! { "dedupeKey": key }, None)
            .await
            .map_err(map_err)?
            .map(JobDocument::into_job)
            .transpose()
    }

    /// Distinguishes "gone" from "owned by someone else" after a conditional
    /// write matched nothing.
    async fn ownership_failure(&self, id: &JobId, oid: ObjectId) -> StoreError {
        match self.collection().find_one(doc! { "_id": oid }, None).await {
            Ok(Some(_)) => StoreError::NotOwner(id.clone()),
            Ok(None) => StoreError::JobNotFound(id.clone()),
            Err(err) => map_err(err),
        }
    }

    async fn release_over_cap(
        &self,
        locked: &JobDocument,
        worker_id: &str,
        now: DateTime,
    ) -> Result<(), StoreError> {
        self.collection()
            .update_one(
                doc! { "_id": locked.id, "lockedBy": worker_id },
                doc! {
                    "$set": { "status": JobStatus::Pending.as_str(), "updatedAt": now },
                    "$unset": unset_lock(),
                    "$inc": { "lockVersion": 1 },
                },
                None,
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for MongoStore {
    async fn create(&self, new_job: NewJob) -> Result<Job, StoreError> {
        if let Some(key) = &new_job.dedupe_key {
            if let Some(existing) = self.find_existing_by_key(key).await? {
                return Ok(existing);
            }
        }
        let document = JobDocument::from_new_job(&new_job, Utc::now())?;
        match self.collection().insert_one(&document, None).await {
            Ok(_) => document.into_job(),
            // Lost an insert race on the unique dedupe index; the winner's
            // record is the job.
            Err(err) if is_duplicate_key(&err) => {
                let key = new_job.dedupe_key.as_deref().unwrap_or_default();
                self.find_existing_by_key(key)
                    .await?
                    .ok_or(StoreError::BadState)
            }
            Err(err) => Err(map_err(err)),
        }
    }

    async fn create_bulk(&self, new_jobs: Vec<NewJob>) -> Result<Vec<Job>, StoreError> {
        let mut created = Vec::with_capacity(new_jobs.len());
        for new_job in new_jobs {
            created.push(self.create(new_job).await?);
        }
        Ok(created)
    }

    async fn find_and_lock_next(&self, request: LockRequest) -> Result<Option<Job>, StoreError> {
        let now = bson_time(request.now);
        let lock_until = bson_time(request.now + request.lock_timeout);
        let mut skipped: Vec<String> = Vec::new();

        while skipped.len() < MAX_NAME_SKIPS {
            let mut eligible = doc! {
                "nextRunAt": { "$lte": now },
                "$or": [
                    // Pending without an active lock ("lockUntil: null" also
                    // matches documents where the field is absent).
                    { "status": JobStatus::Pending.as_str(), "lockUntil": Bson::Null },
                    // Running but stale: the lease expired unrenewed.
                    { "status": JobStatus::Running.as_str(), "lockUntil": { "$lte": now } },
                ],
            };
            if !skipped.is_empty() {
                eligible.insert("name", doc! { "$nin": skipped.clone() });
            }
            let update = doc! {
                "$set": {
                    "status": JobStatus::Running.as_str(),
                    "lockedBy": &request.worker_id,
                    "lockedAt": now,
                    "lockUntil": lock_until,
                    "lastRunAt": now,
                    "updatedAt": now,
                },
                "$inc": { "lockVersion": 1 },
            };
            let options = FindOneAndUpdateOptions::builder()
                .sort(doc! { "priority": 1, "nextRunAt": 1 })
                .return_document(ReturnDocument::After)
                .build();

            let Some(locked) = self
                .collection()
                .find_one_and_update(eligible, update, options)
                .await
                .map_err(map_err)?
            else {
                return Ok(None);
            };

            if let Some(cap) = locked.concurrency {
                let running = self
                    .collection()
                    .count_documents(
                        doc! {
                            "name": &locked.name,
                            "status": JobStatus::Running.as_str(),
                            "_id": { "$ne": locked.id },
                        },
                        None,
                    )
                    .await
                    .map_err(map_err)?;
                // Post-acquisition recount: if the cap is exceeded, the lock
                // is released and the name excluded from this sweep.
                if running >= cap.max(0) as u64 {
                    self.release_over_cap(&locked, &request.worker_id, now)
                        .await?;
                    skipped.push(locked.name.clone());
                    continue;
                }
            }
            return locked.into_job().map(Some);
        }
        Ok(None)
    }

    async fn renew_lock(
        &self,
        id: &JobId,
        worker_id: &str,
        lock_timeout: TimeDelta,
    ) -> Result<Job, StoreError> {
        let oid = object_id(id).map_err(|_| StoreError::LockLost(id.clone()))?;
        let now = Utc::now();
        let renewed = self
            .collection()
            .find_one_and_update(
                doc! {
                    "_id": oid,
                    "lockedBy": worker_id,
                    "status": JobStatus::Running.as_str(),
                },
                doc! {
                    "$set": {
                        "lockedAt": bson_time(now),
                        "lockUntil": bson_time(now + lock_timeout),
                        "updatedAt": bson_time(now),
                    },
                    "$inc": { "lockVersion": 1 },
                },
                returning_after(),
            )
            .await
            .map_err(map_err)?;
        match renewed {
            Some(document) => document.into_job(),
            None => Err(StoreError::LockLost(id.clone())),
        }
    }

    async fn mark_completed(&self, id: &JobId, worker_id: &str) -> Result<Job, StoreError> {
        let oid = object_id(id)?;
        let completed = self
            .collection()
            .find_one_and_update(
                doc! {
                    "_id": oid,
                    "lockedBy": worker_id,
                    "status": JobStatus::Running.as_str(),
                },
                doc! {
                    "$set": {
                        "status": JobStatus::Completed.as_str(),
                        "updatedAt": bson_time(Utc::now()),
                    },
                    "$unset": unset_lock(),
                    "$inc": { "lockVersion": 1 },
                },
                returning_after(),
            )
            .await
            .map_err(map_err)?;
        match completed {
            Some(document) => document.into_job(),
            None => Err(self.ownership_failure(id, oid).await),
        }
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<Job, StoreError> {
        let oid = object_id(id)?;
        let failed = self
            .collection()
            .find_one_and_update(
                doc! {
                    "_id": oid,
                    "lockedBy": worker_id,
                    "status": JobStatus::Running.as_str(),
                },
                doc! {
                    "$set": {
                        "status": JobStatus::Failed.as_str(),
                        "lastError": error,
                        "updatedAt": bson_time(Utc::now()),
                    },
                    "$unset": unset_lock(),
                    "$inc": { "lockVersion": 1 },
                },
                returning_after(),
            )
            .await
            .map_err(map_err)?;
        match failed {
            Some(document) => document.into_job(),
            None => Err(self.ownership_failure(id, oid).await),
        }
    }

    async fn reschedule(
        &self,
        id: &JobId,
        next_run_at: ChronoDateTime<Utc>,
        attempts: Option<u32>,
    ) -> Result<Job, StoreError> {
        let oid = object_id(id)?;
        let at = bson_time(next_run_at);
        let mut set = doc! {
            "status": JobStatus::Pending.as_str(),
            "nextRunAt": at,
            "lastScheduledAt": at,
            "updatedAt": bson_time(Utc::now()),
        };
        let mut inc = doc! { "lockVersion": 1 };
        match attempts {
            Some(attempts) => {
                set.insert("attempts", i64::from(attempts));
            }
            None => {
                inc.insert("attempts", 1);
            }
        }
        let rescheduled = self
            .collection()
            .find_one_and_update(
                doc! { "_id": oid },
                doc! { "$set": set, "$unset": unset_lock(), "$inc": inc },
                returning_after(),
            )
            .await
            .map_err(map_err)?;
        match rescheduled {
            Some(document) => document.into_job(),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn recover_stale_jobs(
        &self,
        now: ChronoDateTime<Utc>,
        lock_timeout: TimeDelta,
    ) -> Result<u64, StoreError> {
        let result = self
            .collection()
            .update_many(
                doc! {
                    "$or": [
                        { "lockUntil": { "$lte": bson_time(now) } },
                        // Legacy/partial records: a lock was taken but no
                        // expiry recorded; age it out by lockedAt instead.
                        {
                            "lockUntil": Bson::Null,
                            "lockedAt": { "$lte": bson_time(now - lock_timeout) },
                        },
                    ],
                },
                doc! {
                    "$set": {
                        "status": JobStatus::Pending.as_str(),
                        "updatedAt": bson_time(now),
                    },
                    "$unset": unset_lock(),
                    "$inc": { "lockVersion": 1 },
                },
                None,
            )
            .await
            .map_err(map_err)?;
        Ok(result.modified_count)
    }

    async fn cancel(&self, id: &JobId) -> Result<Job, StoreError> {
        let oid = object_id(id)?;
        let cancelled = self
            .collection()
            .find_one_and_update(
                doc! { "_id": oid },
                doc! {
                    "$set": {
                        "status": JobStatus::Cancelled.as_str(),
                        "updatedAt": bson_time(Utc::now()),
                    },
                    "$unset": unset_lock(),
                    "$inc": { "lockVersion": 1 },
                },
                returning_after(),
            )
            .await
            .map_err(map_err)?;
        match cancelled {
            Some(document) => document.into_job(),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let Ok(oid) = ObjectId::parse_str(id.as_str()) else {
            return Ok(None);
        };
        self.collection()
            .find_one(doc! { "_id": oid }, None)
            .await
            .map_err(map_err)?
            .map(JobDocument::into_job)
            .transpose()
    }

    async fn find_all<'a>(&self, query: Query<'a>) -> Result<Vec<Job>, StoreError> {
        let documents: Vec<JobDocument> = self
            .collection()
            .find(query_filter(&query), None)
            .await
            .map_err(map_err)?
            .try_collect()
            .await
            .map_err(map_err)?;
        documents.into_iter().map(JobDocument::into_job).collect()
    }

    async fn update(&self, id: &JobId, update: JobUpdate) -> Result<Job, StoreError> {
        let oid = object_id(id)?;
        let mut set = doc! { "updatedAt": bson_time(Utc::now()) };
        let mut unset = doc! {};
        let mut inc = doc! {};
        let mut max = doc! {};

        if let Some(data) = &update.data {
            set.insert(
                "data",
                mongodb::bson::to_bson(data).map_err(|err| StoreError::Serde(err.to_string()))?,
            );
        }
        if let Some(priority) = update.priority {
            set.insert("priority", i32::from(priority));
        }
        if let Some(attempts) = update.attempts {
            max.insert("attempts", i64::from(attempts));
        }
        if let Some(retry) = &update.retry {
            set.insert(
                "retry",
                mongodb::bson::to_bson(retry).map_err(|err| StoreError::Serde(err.to_string()))?,
            );
        }
        if let Some(repeat) = &update.repeat {
            set.insert(
                "repeat",
                mongodb::bson::to_bson(repeat).map_err(|err| StoreError::Serde(err.to_string()))?,
            );
        }
        if let Some(concurrency) = update.concurrency {
            set.insert("concurrency", i64::from(concurrency));
        }
        if let Some(next_run_at) = update.next_run_at {
            // Resetting the run instant revives the job.
            set.insert("status", JobStatus::Pending.as_str());
            set.insert("nextRunAt", bson_time(next_run_at));
            unset = unset_lock();
            inc.insert("lockVersion", 1);
        }

        let mut modifications = doc! { "$set": set };
        if !unset.is_empty() {
            modifications.insert("$unset", unset);
        }
        if !inc.is_empty() {
            modifications.insert("$inc", inc);
        }
        if !max.is_empty() {
            modifications.insert("$max", max);
        }

        let updated = self
            .collection()
            .find_one_and_update(doc! { "_id": oid }, modifications, returning_after())
            .await
            .map_err(map_err)?;
        match updated {
            Some(document) => document.into_job(),
            None => Err(StoreError::JobNotFound(id.clone())),
        }
    }

    async fn count_running(&self, name: &str) -> Result<u64, StoreError> {
        self.collection()
            .count_documents(
                doc! { "name": name, "status": JobStatus::Running.as_str() },
                None,
            )
            .await
            .map_err(map_err)
    }

    async fn prune_jobs(&self, spec: &PruneSpec) -> Result<u64, StoreError> {
        let mut filter = doc! { "status": spec.status.as_str() };
        match &spec.names {
            Spec::Only(names) => {
                filter.insert("name", doc! { "$in": names.clone() });
            }
            Spec::Except(names) if !names.is_empty() => {
                filter.insert("name", doc! { "$nin": names.clone() });
            }
            Spec::Except(_) => {}
        }

        match spec.prune_by {
            PruneBy::MaxAge(age) => {
                filter.insert("updatedAt", doc! { "$lte": bson_time(Utc::now() - age) });
                let result = self
                    .collection()
                    .delete_many(filter, None)
                    .await
                    .map_err(map_err)?;
                Ok(result.deleted_count)
            }
            PruneBy::MaxCount(keep) => {
                // Everything past the newest `keep` matching records goes.
                let options = FindOptions::builder()
                    .sort(doc! { "updatedAt": -1 })
                    .skip(u64::from(keep))
                    .projection(doc! { "_id": 1 })
                    .build();
                let doomed: Vec<Bson> = self
                    .collection()
                    .clone_with_type::<Document>()
                    .find(filter, options)
                    .await
                    .map_err(map_err)?
                    .try_collect::<Vec<Document>>()
                    .await
                    .map_err(map_err)?
                    .into_iter()
                    .filter_map(|document| document.get("_id").cloned())
                    .collect();
                if doomed.is_empty() {
                    return Ok(0);
                }
                let result = self
                    .collection()
                    .delete_many(doc! { "_id": { "$in": doomed } }, None)
                    .await
                    .map_err(map_err)?;
                Ok(result.deleted_count)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_filters_translate_to_expected_documents() {
        assert_eq!(query_filter(&Query::All), doc! {});
        assert_eq!(
            query_filter(&Query::NameEqual("email")),
            doc! { "name": "email" }
        );
        assert_eq!(
            query_filter(&Query::StatusEqual(JobStatus::Running)),
            doc! { "status": "running" }
        );
        assert_eq!(
            query_filter(&Query::StatusIn(&[JobStatus::Pending, JobStatus::Failed])),
            doc! { "status": { "$in": ["pending", "failed"] } }
        );
        assert_eq!(
            query_filter(&Query::And(vec![])),
            doc! {},
            "an empty conjunction matches everything"
        );
        let and = query_filter(&Query::And(vec![
            Query::NameEqual("email"),
            Query::StatusEqual(JobStatus::Pending),
        ]));
        assert_eq!(
            and,
            doc! { "$and": [ { "name": "email" }, { "status": "pending" } ] }
        );
    }

    #[test]
    fn id_filter_ignores_foreign_id_formats() {
        let oid = ObjectId::new();
        let ids = [
            JobId::from(oid.to_hex()),
            JobId::from("not-an-object-id"),
        ];
        let filter = query_filter(&Query::IdIn(&ids));
        let parsed = filter
            .get_document("_id")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], Bson::ObjectId(oid));
    }

    #[test]
    fn unset_lock_covers_every_lock_field() {
        let unset = unset_lock();
        for field in ["lockedBy", "lockedAt", "lockUntil"] {
            assert!(unset.contains_key(field));
        }
        assert_eq!(unset.len(), 3);
    }

    // The shared store contract suite, against a live MongoDB. Ignored by
    // default; point QUENDA_MONGODB_URI at a reachable mongod (default
    // mongodb://localhost:27017) and run with `-- --ignored`. Each test
    // works in its own collection, so runs never interfere with each other
    // or with earlier runs.
    async fn contract_store() -> MongoStore {
        let uri = std::env::var("QUENDA_MONGODB_URI")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_owned());
        let client = mongodb::Client::with_uri_str(&uri)
            .await
            .expect("failed to connect to MongoDB");
        let collection = client
            .database("quenda_contract_tests")
            .collection(&format!("jobs_{}", uuid::Uuid::new_v4().simple()));
        let store = MongoStore::with_collection(collection);
        store
            .ensure_indexes()
            .await
            .expect("failed to create indexes");
        store
    }

    quenda::store_test_suite!(
        attr: tokio::test,
        ignore: "requires a running MongoDB (set QUENDA_MONGODB_URI)",
        store: contract_store().await
    );
}
