//! One-stop imports for typical scheduler usage.
//!
//! ```
//! # #![allow(unused_imports)]
//! use quenda::prelude::*;
//! ```

pub use crate::event::{Event, EventBus};
pub use crate::handler::{handler_fn, HandlerError, HandlerRegistry, JobHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus, JobUpdate, NewJob, ValidationError};
pub use crate::planner::RepeatSpec;
pub use crate::pruner::{PruneBy, PruneSpec, Pruner, PrunerConfig};
pub use crate::retry::{Backoff, RetryDelay, RetrySpec};
pub use crate::store::{JobStore, LockRequest, Query, StoreError};
pub use crate::{SchedulerError, StopOptions, Supervisor, SupervisorConfig};
