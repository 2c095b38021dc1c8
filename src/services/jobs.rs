// src/services/jobs.rs

//! Owner-facing job operations: enqueue, list, status, delete, download.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{Config, Job, JobKey, MAX_BATCH_WRITES};
use crate::pipeline::AccessPolicy;
use crate::services::api::GraphApi;
use crate::storage::{BlobStore, DocumentStore, JobOrder, JobQuery, paths};
use crate::utils::{bounded, sha256_hex};

/// Progress view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub display_name: String,
    pub friend_count: u64,
    pub follower_count: u64,
    /// Child tasks created so far
    pub enqueued: usize,
    /// Child tasks not yet hydrated
    pub remaining: usize,
    pub status: String,
    pub phase: &'static str,
    pub done: bool,
    /// Blob key of the graph file; shown once done, or to admins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_path: Option<String>,
    /// Root account id; admins only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
}

/// A built graph file ready to hand out.
#[derive(Debug, Clone)]
pub struct GraphDownload {
    pub file_name: String,
    pub content_disposition: String,
    pub bytes: Vec<u8>,
}

/// Job management on behalf of owners.
pub struct JobService {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    api: Arc<dyn GraphApi>,
    policy: AccessPolicy,
    graph_prefix: String,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl JobService {
    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        api: Arc<dyn GraphApi>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            store,
            blobs,
            api,
            policy,
            graph_prefix: config.storage.graph_prefix.clone(),
            call_timeout: config.crawler.call_timeout(),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie every call made by this service to `cancel`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn load(&self, key: &JobKey) -> Result<Job> {
        bounded(self.call_timeout, &self.cancel, self.store.get_job(key))
            .await?
            .ok_or_else(|| AppError::not_found(format!("job {}", key)))
    }

    /// Look `handle` up and create a job for it.
    ///
    /// Enqueueing an account the owner already has a job for leaves that
    /// job untouched and returns its key.
    pub async fn enqueue(&self, owner_id: &str, handle: &str) -> Result<JobKey> {
        let handle = handle.trim().trim_start_matches('@');
        if owner_id.is_empty() || handle.is_empty() {
            return Err(AppError::validation("owner id and handle are required"));
        }

        let profile = match bounded(self.call_timeout, &self.cancel, self.api.lookup_by_handle(handle)).await {
            Ok(profile) => profile,
            Err(AppError::AccountUnavailable { reason, .. }) => {
                return Err(AppError::not_found(format!("account {} ({})", handle, reason)));
            }
            Err(e) => return Err(e),
        };

        let key = JobKey::new(owner_id, profile.id.clone());
        if bounded(self.call_timeout, &self.cancel, self.store.get_job(&key))
            .await?
            .is_some()
        {
            log::info!("Job {} already exists, not re-enqueueing", key);
            return Ok(key);
        }

        let job = Job::new(owner_id, &profile, Utc::now());
        bounded(self.call_timeout, &self.cancel, self.store.put_job(&job)).await?;
        log::info!("Enqueued {} ({}) for {}", profile.screen_name, profile.id, owner_id);
        Ok(key)
    }

    /// All of an owner's jobs, by root display name.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<Job>> {
        let query = JobQuery::default().owner(owner_id).order(JobOrder::DisplayName);
        bounded(self.call_timeout, &self.cancel, self.store.query_jobs(&query)).await
    }

    /// Progress of one job as seen by `caller`.
    pub async fn status(&self, caller: &str, key: &JobKey) -> Result<JobStatus> {
        let job = self.load(key).await?;
        let enqueued = bounded(self.call_timeout, &self.cancel, self.store.count_children(key, None)).await?;
        let remaining = bounded(self.call_timeout, &self.cancel, self.store.count_children(key, Some(false))).await?;
        let admin = self.policy.is_admin(caller);

        Ok(JobStatus {
            display_name: job.node.display_name.clone(),
            friend_count: job.node.friend_count,
            follower_count: job.node.follower_count,
            enqueued,
            remaining,
            status: job.status.clone(),
            phase: job.phase().name(),
            done: job.done,
            graph_path: (job.done || admin).then(|| paths::graph_key(&self.graph_prefix, key)),
            root_id: admin.then(|| job.root_id().to_string()),
        })
    }

    /// Delete a job and all of its child tasks, children first.
    ///
    /// Returns the number of child tasks removed.
    pub async fn delete(&self, key: &JobKey) -> Result<usize> {
        self.load(key).await?;

        let child_keys = bounded(self.call_timeout, &self.cancel, self.store.child_keys(key)).await?;
        for batch in child_keys.chunks(MAX_BATCH_WRITES) {
            bounded(self.call_timeout, &self.cancel, self.store.delete_children(batch)).await?;
        }
        bounded(self.call_timeout, &self.cancel, self.store.delete_job(key)).await?;

        log::info!("Deleted job {} and {} child tasks", key, child_keys.len());
        Ok(child_keys.len())
    }

    /// Fetch the built graph file of a finished job.
    pub async fn download(&self, key: &JobKey) -> Result<GraphDownload> {
        let job = self.load(key).await?;
        if !job.done {
            return Err(AppError::not_found(format!("graph for {} (not built yet)", key)));
        }

        let path = paths::graph_key(&self.graph_prefix, key);
        let bytes = bounded(self.call_timeout, &self.cancel, self.blobs.read(&path))
            .await?
            .ok_or_else(|| AppError::not_found(format!("graph file {}", path)))?;

        if let Some(expected) = &job.graph_digest {
            let actual = sha256_hex(&bytes);
            if &actual != expected {
                return Err(AppError::persistence(format!(
                    "graph file {} digest mismatch: expected {}, got {}",
                    path, expected, actual
                )));
            }
        }

        Ok(GraphDownload {
            file_name: format!("{}.gml", job.node.display_name),
            content_disposition: paths::content_disposition(&job.node.display_name),
            bytes,
        })
    }
}
