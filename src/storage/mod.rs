//! Storage abstractions for crawl state and graph files.
//!
//! Two collaborators live here:
//! - [`DocumentStore`]: hierarchical job/child documents keyed by
//!   `(owner, root[, child])`, with equality-filtered range queries,
//!   bulk writes capped at [`MAX_BATCH_WRITES`] and optimistic
//!   multi-document transactions.
//! - [`BlobStore`]: write-once graph files.
//!
//! ## Key layout
//!
//! ```text
//! users/{owner}/jobs/{root}                    # Job
//! users/{owner}/jobs/{root}/children/{child}   # ChildTask
//! {graph_prefix}/{owner}/{root}                # exported graph blob
//! ```

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{AppError, Result};
use crate::models::{ChildKey, ChildTask, Job, JobKey};

// Re-export for convenience
pub use crate::models::MAX_BATCH_WRITES;
pub use local::{LocalBlobStore, LocalSnapshot};
pub use memory::MemoryStore;

/// Attempts made by [`run_transaction`] before a conflict is surfaced.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 5;

/// Sort order for job queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Oldest first
    #[default]
    CreatedAt,
    /// Root display name, then root id
    DisplayName,
}

/// Equality-filtered job range query.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub owner_id: Option<String>,
    pub done: Option<bool>,
    pub order: JobOrder,
    pub limit: Option<usize>,
}

impl JobQuery {
    /// Unfinished jobs, oldest first.
    pub fn unfinished() -> Self {
        Self {
            done: Some(false),
            ..Self::default()
        }
    }

    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn order(mut self, order: JobOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One optimistic transaction. Reads are tracked and validated on commit;
/// writes are buffered and visible to later reads in the same transaction.
#[async_trait]
pub trait Transaction: Send {
    async fn get_job(&mut self, key: &JobKey) -> Result<Option<Job>>;

    /// Any one unhydrated child of `job`.
    async fn pending_child(&mut self, job: &JobKey) -> Result<Option<ChildTask>>;

    fn put_job(&mut self, job: Job);

    fn put_child(&mut self, child: ChildTask);

    /// Apply buffered writes, or fail with [`AppError::Conflict`] when a
    /// document read by this transaction changed underneath it.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Durable job and child-task documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>>;

    /// Whole-record replacement.
    async fn put_job(&self, job: &Job) -> Result<()>;

    /// Status-only patch; fails with `NotFound` if the job is gone.
    async fn update_status(&self, key: &JobKey, status: &str) -> Result<()>;

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    async fn delete_job(&self, key: &JobKey) -> Result<()>;

    /// One bulk write of at most [`MAX_BATCH_WRITES`] children.
    async fn put_children(&self, children: &[ChildTask]) -> Result<()>;

    /// Children of `job`, optionally filtered on the hydrated flag.
    async fn query_children(&self, job: &JobKey, hydrated: Option<bool>) -> Result<Vec<ChildTask>>;

    async fn count_children(&self, job: &JobKey, hydrated: Option<bool>) -> Result<usize>;

    async fn child_keys(&self, job: &JobKey) -> Result<Vec<ChildKey>>;

    /// One bulk delete of at most [`MAX_BATCH_WRITES`] children.
    async fn delete_children(&self, keys: &[ChildKey]) -> Result<()>;

    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Run `body` in a transaction, re-running it from scratch on conflict.
///
/// Errors returned by `body` abort the transaction without retry.
pub async fn run_transaction<T, F>(store: &dyn DocumentStore, mut body: F) -> Result<T>
where
    T: Send,
    F: for<'t> FnMut(&'t mut dyn Transaction) -> BoxFuture<'t, Result<T>> + Send,
{
    let mut attempt = 1;
    loop {
        let mut tx = store.begin().await?;
        let value = body(&mut *tx).await?;
        match tx.commit().await {
            Ok(()) => return Ok(value),
            Err(AppError::Conflict(doc)) if attempt < MAX_TRANSACTION_ATTEMPTS => {
                log::debug!("Transaction conflict on {} (attempt {}), retrying", doc, attempt);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write-once blob storage for exported graphs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, path: &str, bytes: &[u8], content_disposition: &str) -> Result<()>;

    /// Read a blob, returning `None` if it doesn't exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Durable home of a whole-store snapshot shared by every process that
/// opens it. Updates are compare-and-swap on an opaque revision.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Current snapshot bytes and their revision, `None` before the first save.
    async fn load(&self) -> Result<Option<(Vec<u8>, String)>>;

    /// Replace the snapshot if it is still at `expected` (`None`: still
    /// absent). Returns `false` when another writer got there first.
    async fn swap(&self, bytes: &[u8], expected: Option<&str>) -> Result<bool>;

    /// Human-readable location for logs.
    fn location(&self) -> String;
}

/// Blob key helpers.
pub mod paths {
    use crate::models::JobKey;

    /// Blob key of the graph file for a job.
    pub fn graph_key(prefix: &str, job: &JobKey) -> String {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", job.owner_id, job.root_id)
        } else {
            format!("{}/{}/{}", prefix, job.owner_id, job.root_id)
        }
    }

    /// Download disposition naming the file after the root account.
    pub fn content_disposition(display_name: &str) -> String {
        format!("Attachment; filename={}.gml", display_name)
    }

}
