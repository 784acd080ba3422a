//! The durable job record and the submission-side types that feed it.
//!
//! A [`Job`] is the single persisted entity of the scheduler. Its field names
//! are fixed (camelCase on the wire) so that records written by one store
//! implementation are operable by any other.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planner::{self, RepeatSpec};
use crate::retry::RetrySpec;

pub mod builder;

/// Opaque unique job identifier assigned by the store at creation.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: a job leaves them only
/// when its `nextRunAt` is explicitly reset, which returns it to `Pending`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smallest allowed priority (highest urgency).
pub const PRIORITY_MIN: u8 = 1;
/// Largest allowed priority (lowest urgency).
pub const PRIORITY_MAX: u8 = 10;
/// Priority assigned when the submitter does not choose one.
pub const PRIORITY_DEFAULT: u8 = 5;

/// The persisted job record.
///
/// Invariants maintained by the stores:
///
/// - `status == Running` iff `locked_by` and `lock_until` are set;
/// - `attempts` never decreases;
/// - at most one record exists per non-null `dedupe_key`;
/// - `lock_version` strictly increases on every lock mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    /// Logical job type; handlers are registered against it and concurrency
    /// caps are scoped to it.
    pub name: String,
    /// Opaque user payload. The core never traverses it.
    #[serde(default)]
    pub data: serde_json::Value,
    pub status: JobStatus,
    /// Earliest instant at which the job is eligible for acquisition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Instant of the most recent acquisition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// For cron jobs: the logical slot last committed, decoupling the
    /// schedule from the wall clock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    /// Instant at which the current lock expires unless renewed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_until: Option<DateTime<Utc>>,
    /// Monotonic counter bumped on every lock mutation; the linearization
    /// witness for optimistic checks.
    pub lock_version: u64,
    /// Total acquisition count across the whole fleet and all restarts.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,
    /// Idempotency key; at most one job with any given value may exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Integer in `[1, 10]`, lower wins. Defaults to 5.
    pub priority: u8,
    /// Global cap on simultaneous running jobs sharing this `name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True when the job holds a lock that has not yet expired at `now`.
    pub fn has_active_lock(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.is_some_and(|until| until > now)
    }

    /// True when the job may be acquired at `now`: due, and either pending
    /// without an active lock or running with an expired (stale) lock.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        if !self.next_run_at.is_some_and(|at| at <= now) {
            return false;
        }
        match self.status {
            JobStatus::Pending => !self.has_active_lock(now),
            JobStatus::Running => self.lock_until.is_some_and(|until| until <= now),
            _ => false,
        }
    }
}

/// A validated submission, ready for [`crate::store::JobStore::create`].
///
/// Stores assume the validation rules have been applied; use
/// [`NewJob::validate`] or go through [`builder::JobBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Earliest run instant. Defaults to "now" at creation time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

impl NewJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: serde_json::Value::Null,
            run_at: None,
            retry: None,
            repeat: None,
            dedupe_key: None,
            priority: None,
            concurrency: None,
        }
    }

    /// Checks the submission rules the stores rely on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if let Some(priority) = self.priority {
            if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
                return Err(ValidationError::PriorityOutOfRange(priority));
            }
        }
        if self.concurrency == Some(0) {
            return Err(ValidationError::ZeroConcurrency);
        }
        if let Some(repeat) = &self.repeat {
            match (&repeat.cron, repeat.every) {
                (Some(_), Some(_)) => return Err(ValidationError::ConflictingRepeat),
                (None, None) => return Err(ValidationError::EmptyRepeat),
                (Some(expr), None) => {
                    planner::parse_cron(expr)
                        .map_err(|err| ValidationError::InvalidCron(err.to_string()))?;
                }
                (None, Some(every)) if every < 0 => {
                    return Err(ValidationError::NegativeInterval(every));
                }
                (None, Some(_)) => {}
            }
            if let Some(tz) = &repeat.timezone {
                if tz.parse::<chrono_tz::Tz>().is_err() {
                    return Err(ValidationError::UnknownTimezone(tz.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Fields a caller may change through the public update path.
///
/// `status` and the lock fields are deliberately absent: lifecycle and lock
/// transitions go through the dedicated store operations only. Setting
/// `next_run_at` implicitly returns the job to `Pending` and clears any lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub data: Option<serde_json::Value>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
    /// Clamped monotone: the persisted value never decreases.
    pub attempts: Option<u32>,
    pub retry: Option<RetrySpec>,
    pub repeat: Option<RepeatSpec>,
    pub concurrency: Option<u32>,
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Rejections from the submission surface. Jobs failing validation are never
/// created.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("job name must not be empty")]
    EmptyName,
    #[error("priority {0} is outside [{PRIORITY_MIN}, {PRIORITY_MAX}]")]
    PriorityOutOfRange(u8),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("repeat.cron and repeat.every are mutually exclusive")]
    ConflictingRepeat,
    #[error("repeat must set either cron or every")]
    EmptyRepeat,
    #[error("repeat.every must be non-negative, got {0}")]
    NegativeInterval(i64),
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("unknown IANA timezone {0:?}")]
    UnknownTimezone(String),
    #[error("job data is not serializable: {0}")]
    UnserializableData(String),
}
