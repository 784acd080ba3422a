//! BSON representation of the persisted job record.
//!
//! Field names follow the shared wire layout (camelCase), so records written
//! here are operable by any other store implementation and vice versa.
//! Instants are stored as native BSON datetimes (millisecond precision).

use chrono::Utc;
use mongodb::bson::{self, oid::ObjectId, Bson, DateTime};
use serde::{Deserialize, Serialize};

use quenda::job::{Job, JobId, JobStatus, NewJob, PRIORITY_DEFAULT};
use quenda::planner::RepeatSpec;
use quenda::retry::RetrySpec;
use quenda::store::StoreError;

fn null_bson() -> Bson {
    Bson::Null
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    #[serde(default = "null_bson")]
    pub data: Bson,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime>,
    #[serde(default)]
    pub lock_version: i64,
    #[serde(default)]
    pub attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i64>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl JobDocument {
    pub(crate) fn from_new_job(new_job: &NewJob, now: chrono::DateTime<Utc>) -> Result<Self, StoreError> {
        let now = DateTime::from_chrono(now);
        Ok(Self {
            id: ObjectId::new(),
            name: new_job.name.clone(),
            data: bson::to_bson(&new_job.data).map_err(|err| StoreError::Serde(err.to_string()))?,
            status: JobStatus::Pending,
            next_run_at: Some(
                new_job
                    .run_at
                    .map(DateTime::from_chrono)
                    .unwrap_or(now),
            ),
            last_run_at: None,
            last_scheduled_at: None,
            locked_at: None,
            locked_by: None,
            lock_until: None,
            lock_version: 0,
            attempts: 0,
            last_error: None,
            retry: new_job.retry.clone(),
            repeat: new_job.repeat.clone(),
            dedupe_key: new_job.dedupe_key.clone(),
            priority: i32::from(new_job.priority.unwrap_or(PRIORITY_DEFAULT)),
            concurrency: new_job.concurrency.map(i64::from),
            created_at: now,
            updated_at: now,
        })
    }

    pub(crate) fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: JobId::from(self.id.to_hex()),
            name: self.name,
            data: bson::from_bson(self.data).map_err(|err| StoreError::Serde(err.to_string()))?,
            status: self.status,
            next_run_at: self.next_run_at.map(DateTime::to_chrono),
            last_run_at: self.last_run_at.map(DateTime::to_chrono),
            last_scheduled_at: self.last_scheduled_at.map(DateTime::to_chrono),
            locked_at: self.locked_at.map(DateTime::to_chrono),
            locked_by: self.locked_by,
            lock_until: self.lock_until.map(DateTime::to_chrono),
            lock_version: self.lock_version.max(0) as u64,
            attempts: self.attempts.clamp(0, i64::from(u32::MAX)) as u32,
            last_error: self.last_error,
            retry: self.retry,
            repeat: self.repeat,
            dedupe_key: self.dedupe_key,
            priority: self.priority.clamp(0, i32::from(u8::MAX)) as u8,
            concurrency: self
                .concurrency
                .map(|cap| cap.clamp(0, i64::from(u32::MAX)) as u32),
            created_at: self.created_at.to_chrono(),
            updated_at: self.updated_at.to_chrono(),
        })
    }
}
