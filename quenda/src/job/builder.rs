//! Fluent construction of job submissions.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::job::{NewJob, ValidationError};
use crate::planner::RepeatSpec;
use crate::retry::RetrySpec;

/// Builds a validated [`NewJob`].
///
/// ```
/// # use quenda::job::builder::JobBuilder;
/// # use chrono::TimeDelta;
/// let new_job = JobBuilder::new("send-email")
///     .data(&serde_json::json!({"to": "ops@example.com"}))
///     .run_in(TimeDelta::seconds(30))
///     .retry(3)
///     .priority(2)
///     .build()
///     .unwrap();
/// assert_eq!(new_job.name, "send-email");
/// ```
pub struct JobBuilder {
    name: String,
    data: Result<serde_json::Value, String>,
    run_at: Option<DateTime<Utc>>,
    retry: Option<RetrySpec>,
    repeat: Option<RepeatSpec>,
    dedupe_key: Option<String>,
    priority: Option<u8>,
    concurrency: Option<u32>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Ok(serde_json::Value::Null),
            run_at: None,
            retry: None,
            repeat: None,
            dedupe_key: None,
            priority: None,
            concurrency: None,
        }
    }

    /// Attaches the opaque payload. Serialization failures surface from
    /// [`JobBuilder::build`].
    pub fn data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).map_err(|err| err.to_string());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn run_in(self, delay: TimeDelta) -> Self {
        self.run_at(Utc::now() + delay)
    }

    /// Retry policy; accepts a bare attempt count or a full [`RetrySpec`].
    pub fn retry(mut self, retry: impl Into<RetrySpec>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Repeat on a fixed interval, in milliseconds.
    pub fn every(mut self, every_ms: i64) -> Self {
        self.repeat.get_or_insert_with(RepeatSpec::default).every = Some(every_ms);
        self
    }

    /// Repeat on a cron schedule (5-field, or 6-field with leading seconds).
    pub fn cron(mut self, expr: impl Into<String>) -> Self {
        self.repeat.get_or_insert_with(RepeatSpec::default).cron = Some(expr.into());
        self
    }

    /// IANA timezone for the cron schedule.
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.repeat.get_or_insert_with(RepeatSpec::default).timezone = Some(timezone.into());
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn concurrency(mut self, cap: u32) -> Self {
        self.concurrency = Some(cap);
        self
    }

    pub fn build(self) -> Result<NewJob, ValidationError> {
        let data = self.data.map_err(ValidationError::UnserializableData)?;
        let new_job = NewJob {
            name: self.name,
            data,
            run_at: self.run_at,
            retry: self.retry,
            repeat: self.repeat,
            dedupe_key: self.dedupe_key,
            priority: self.priority,
            concurrency: self.concurrency,
        };
        new_job.validate()?;
        Ok(new_job)
    }
}
