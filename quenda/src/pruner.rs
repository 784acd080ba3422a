//! Retention policies for finished job records.
//!
//! Terminal records (`completed`, `failed`, `cancelled`) stay in the store
//! until something removes them. A [`PrunerConfig`] describes what to remove
//! and on what schedule; the supervisor runs it alongside the workers.
//!
//! ```
//! # use quenda::pruner::{Pruner, PrunerConfig};
//! # use quenda::job::JobStatus;
//! # use quenda::planner::parse_cron;
//! # use chrono::TimeDelta;
//! let config = PrunerConfig::new(parse_cron("0 * * * *").unwrap())
//!     .with_pruner(Pruner::max_age(TimeDelta::days(31), JobStatus::Completed))
//!     .with_pruner(
//!         Pruner::max_count(200, JobStatus::Failed)
//!             .only("send-email")
//!             .and("sync-accounts"),
//!     );
//! # let _ = config;
//! ```

use chrono::TimeDelta;
use cron::Schedule;

use crate::job::{Job, JobStatus};

pub(crate) mod runner;

/// A single retention rule, as consumed by the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    /// Records in this state are eligible for removal.
    pub status: JobStatus,
    pub prune_by: PruneBy,
    pub names: Spec,
}

impl PruneSpec {
    /// True when the rule's status and name filters select `job`. Age and
    /// count limits are evaluated by the store, not here.
    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        match &self.names {
            Spec::Only(names) => names.iter().any(|name| *name == job.name),
            Spec::Except(names) => !names.iter().any(|name| *name == job.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove matching records whose last update is older than this.
    MaxAge(TimeDelta),
    /// Keep only the most recently updated N matching records.
    MaxCount(u32),
}

/// Which job names a rule applies to. `Except(vec![])` means every name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Spec {
    Except(Vec<String>),
    Only(Vec<String>),
}

/// Builder for a [`PruneSpec`], scoped to all names until narrowed with
/// [`Pruner::only`] or [`Pruner::except`].
#[allow(private_bounds)]
pub struct Pruner<T>
where
    T: IntoSpec,
{
    status: JobStatus,
    prune_by: PruneBy,
    names: T,
}

impl Pruner<All> {
    pub fn max_age(age: TimeDelta, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxAge(age),
            names: All,
        }
    }

    pub fn max_count(count: u32, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxCount(count),
            names: All,
        }
    }

    pub fn only(self, name: impl Into<String>) -> Pruner<Only> {
        Pruner {
            status: self.status,
            prune_by: self.prune_by,
            names: Only(vec![name.into()]),
        }
    }

    pub fn except(self, name: impl Into<String>) -> Pruner<Except> {
        Pruner {
            status: self.status,
            prune_by: self.prune_by,
            names: Except(vec![name.into()]),
        }
    }
}

impl Pruner<Only> {
    pub fn and(mut self, name: impl Into<String>) -> Self {
        self.names.0.push(name.into());
        self
    }
}

impl Pruner<Except> {
    pub fn and(mut self, name: impl Into<String>) -> Self {
        self.names.0.push(name.into());
        self
    }
}

impl<T> From<Pruner<T>> for PruneSpec
where
    T: IntoSpec,
{
    fn from(value: Pruner<T>) -> Self {
        Self {
            status: value.status,
            prune_by: value.prune_by,
            names: value.names.into_spec(),
        }
    }
}

trait IntoSpec {
    fn into_spec(self) -> Spec;
}

pub struct All;
impl IntoSpec for All {
    fn into_spec(self) -> Spec {
        Spec::Except(Vec::new())
    }
}

pub struct Only(Vec<String>);
impl IntoSpec for Only {
    fn into_spec(self) -> Spec {
        Spec::Only(self.0)
    }
}

pub struct Except(Vec<String>);
impl IntoSpec for Except {
    fn into_spec(self) -> Spec {
        Spec::Except(self.0)
    }
}

/// The pruning schedule and its rules.
#[derive(Debug, Clone)]
pub struct PrunerConfig {
    pub(crate) schedule: Schedule,
    pub(crate) pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            pruners: Vec::new(),
        }
    }

    #[allow(private_bounds)]
    pub fn with_pruner<T>(mut self, pruner: Pruner<T>) -> Self
    where
        T: IntoSpec,
    {
        self.pruners.push(pruner.into());
        self
    }

    #[allow(private_bounds)]
    pub fn with_pruners<T>(mut self, pruners: impl IntoIterator<Item = Pruner<T>>) -> Self
    where
        T: IntoSpec,
    {
        self.pruners.extend(pruners.into_iter().map(Into::into));
        self
    }
}
