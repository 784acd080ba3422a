//! User-supplied job handlers and the per-name registry workers consult.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinError;

use crate::job::Job;

/// Failure raised by a handler. Drives the retry-or-fail decision; never
/// fatal to the worker.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extracts a panic payload from a joined handler task, the message if
    /// the panic carried one.
    pub(crate) fn from_join_error(error: JoinError) -> Self {
        let fallback = error.to_string();
        let message = match error.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(fallback),
            Err(_) => fallback,
        };
        Self { message }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The work behind a job name.
///
/// Receives a snapshot of the job record taken at acquisition time; may
/// perform arbitrary I/O. Long handlers are protected by the worker's lock
/// heartbeat, so blocking without yielding starves the heartbeat and risks
/// losing the lock.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: Job) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`JobHandler`].
///
/// ```
/// # use quenda::handler::{handler_fn, HandlerError};
/// let handler = handler_fn(|job| async move {
///     tracing::info!(name = %job.name, "processing");
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn run(&self, job: Job) -> Result<(), HandlerError> {
        (self.f)(job).await
    }
}

/// Maps job names to handlers. Cheap to clone; clones share the map.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for jobs named `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: impl JobHandler + 'static) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}
