//! MongoDB implementation of the quenda [`JobStore`](quenda::store::JobStore).
//!
//! Every state-dependent transition is a single atomic
//! `findOneAndUpdate`/`updateOne` whose filter carries the `lockedBy` and
//! `status` conditions, so concurrent workers on separate machines can share
//! one collection safely. Acquisition is a sorted `findOneAndUpdate` over the
//! eligibility predicate — the only operation that must be atomic across the
//! record set — and MongoDB's document-level atomicity provides exactly that.
//!
//! ```no_run
//! # async fn demo() -> Result<(), quenda::SchedulerError> {
//! use quenda::prelude::*;
//! use quenda_mongo::MongoStore;
//!
//! let store = MongoStore::connect("mongodb://localhost:27017", "myapp").await?;
//! let scheduler = Supervisor::new(store)
//!     .with_workers(4)
//!     .register("send-email", handler_fn(|_job| async { Ok(()) }));
//! scheduler.start().await?;
//! # Ok(())
//! # }
//! ```

use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use quenda::store::StoreError;

mod document;
mod store;

pub use document::JobDocument;

/// A job store backed by one MongoDB collection.
///
/// Clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct MongoStore {
    jobs: Collection<JobDocument>,
}

impl MongoStore {
    /// Default collection name used by [`MongoStore::connect`].
    pub const DEFAULT_COLLECTION: &'static str = "jobs";

    /// Connects and prepares the `jobs` collection, creating the poll,
    /// dedupe, recovery and concurrency indexes.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        Self::connect_with_collection(uri, database, Self::DEFAULT_COLLECTION).await
    }

    /// Like [`MongoStore::connect`] with an explicit collection name.
    pub async fn connect_with_collection(
        uri: &str,
        database: &str,
        collection: &str,
    ) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await.map_err(map_err)?;
        let store = Self::with_collection(client.database(database).collection(collection));
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// Wraps an existing collection without touching indexes.
    pub fn with_collection(jobs: Collection<JobDocument>) -> Self {
        Self { jobs }
    }

    pub fn collection(&self) -> &Collection<JobDocument> {
        &self.jobs
    }

    /// Creates the supporting indexes. Idempotent and non-blocking
    /// (background builds); safe to re-run at every startup.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let background = || IndexOptions::builder().background(true).build();
        let indexes = vec![
            // Primary poll index: matches the acquisition sort.
            IndexModel::builder()
                .keys(doc! { "status": 1, "priority": 1, "nextRunAt": 1 })
                .options(background())
                .build(),
            IndexModel::builder()
                .keys(doc! { "dedupeKey": 1 })
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .sparse(true)
                        .background(true)
                        .build(),
                )
                .build(),
            // Stale-lock recovery scans.
            IndexModel::builder()
                .keys(doc! { "lockUntil": 1 })
                .options(
                    IndexOptions::builder()
                        .sparse(true)
                        .background(true)
                        .build(),
                )
                .build(),
            // Concurrency-cap counting.
            IndexModel::builder()
                .keys(doc! { "name": 1, "status": 1 })
                .options(background())
                .build(),
        ];
        self.jobs
            .create_indexes(indexes, None)
            .await
            .map_err(map_err)?;
        tracing::debug!(collection = %self.jobs.name(), "job indexes ensured");
        Ok(())
    }
}

pub(crate) fn map_err(err: mongodb::error::Error) -> StoreError {
    StoreError::Storage(err.to_string())
}

pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|error| error.code == 11000)),
        _ => false,
    }
}
