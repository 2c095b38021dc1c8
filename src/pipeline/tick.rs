// src/pipeline/tick.rs

//! The crawl state machine.
//!
//! One call to [`TickEngine::tick`] performs exactly one unit of forward
//! progress for one job and persists it before returning, so a job left
//! behind by a failed or crashed tick resumes from its stored fields.
//!
//! | Phase | Work | Upstream calls |
//! |---|---|---|
//! | PreparingOutput | export graph, write blob, mark done | 0 |
//! | NotStarted / PagingFollowers | one follower page, bulk child write | 1 |
//! | PagingFriends | one friend page, bulk child write | 1 |
//! | Counting | distinct child count | 0 |
//! | Hydrating | one child lookup (+ inline id pages), transactional | 1-3 |

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{ChildTask, Config, Cursor, GraphNode, Job, Phase, Relationship};
use crate::pipeline::graph::export_graph;
use crate::services::api::{GraphApi, lookup_or_placeholder};
use crate::services::pages::{FetchedPage, fetch_followers_page, fetch_friends_page};
use crate::storage::{BlobStore, DocumentStore, paths, run_transaction};
use crate::utils::{bounded, sha256_hex};

pub const GRAPH_BUILT: &str = "Graph built";
pub const PREPARING_GRAPH: &str = "Preparing graph";

/// Tuning knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct TickSettings {
    pub page_size: u32,
    pub inline_expansion_limit: u64,
    pub write_batch_size: usize,
    pub call_timeout: Duration,
    pub graph_prefix: String,
}

impl TickSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.crawler.page_size,
            inline_expansion_limit: config.crawler.inline_expansion_limit,
            write_batch_size: config.crawler.write_batch_size,
            call_timeout: config.crawler.call_timeout(),
            graph_prefix: config.storage.graph_prefix.clone(),
        }
    }

    /// Whether a hydrated child's own list of `count` ids is small enough
    /// to attach inline.
    fn expands(&self, count: u64) -> bool {
        count != 0 && count <= self.inline_expansion_limit
    }
}

/// Result of one successful tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub status: String,
    /// Upstream calls made, including those of retried transaction attempts
    pub calls: u32,
}

/// Advances single jobs by one step.
#[derive(Clone)]
pub struct TickEngine {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    api: Arc<dyn GraphApi>,
    settings: TickSettings,
}

impl TickEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        api: Arc<dyn GraphApi>,
        settings: TickSettings,
    ) -> Self {
        Self {
            store,
            blobs,
            api,
            settings,
        }
    }

    pub fn settings(&self) -> &TickSettings {
        &self.settings
    }

    /// Run one step for a freshly loaded job.
    pub async fn tick(&self, job: Job, cancel: &CancellationToken) -> Result<TickOutcome> {
        let calls = AtomicU32::new(0);
        let status = self.tick_counted(job, cancel, &calls).await?;
        Ok(TickOutcome {
            status,
            calls: calls.load(Ordering::SeqCst),
        })
    }

    /// Like [`tick`](Self::tick), but records upstream calls into `calls`
    /// as they are made so failed ticks can be charged too.
    pub async fn tick_counted(&self, job: Job, cancel: &CancellationToken, calls: &AtomicU32) -> Result<String> {
        let phase = job.phase();
        log::debug!("Tick {} in phase {}", job.key(), phase.name());

        match phase {
            Phase::Done => Err(AppError::AlreadyComplete(job.root_id().to_string())),
            Phase::PreparingOutput => self.build_output(job, cancel).await,
            Phase::NotStarted => self.page(job, Relationship::Follower, Cursor::Start, cancel, calls).await,
            Phase::PagingFollowers(cursor) => self.page(job, Relationship::Follower, cursor, cancel, calls).await,
            Phase::PagingFriends(cursor) => self.page(job, Relationship::Friend, cursor, cancel, calls).await,
            Phase::Counting => self.count(job, cancel).await,
            Phase::Hydrating { .. } => self.hydrate(job, cancel, calls).await,
        }
    }

    /// Export the graph, write it, then mark the job terminal.
    async fn build_output(&self, mut job: Job, cancel: &CancellationToken) -> Result<String> {
        let key = job.key();
        let timeout = self.settings.call_timeout;

        let children = bounded(timeout, cancel, self.store.query_children(&key, Some(true))).await?;
        let nodes: Vec<GraphNode> = children.into_iter().map(|child| child.node).collect();
        let bytes = export_graph(&job.node, &nodes);

        let path = paths::graph_key(&self.settings.graph_prefix, &key);
        let disposition = paths::content_disposition(&job.node.display_name);
        bounded(timeout, cancel, self.blobs.write(&path, &bytes, &disposition)).await?;

        job.finish(sha256_hex(&bytes));
        bounded(timeout, cancel, self.store.put_job(&job)).await?;

        log::info!("Built graph for {} ({} nodes) at {}", key, nodes.len() + 1, path);
        Ok(GRAPH_BUILT.to_string())
    }

    /// Fetch one page of ids for the root and enqueue a child per id.
    async fn page(
        &self,
        mut job: Job,
        relationship: Relationship,
        cursor: Cursor,
        cancel: &CancellationToken,
        calls: &AtomicU32,
    ) -> Result<String> {
        let key = job.key();
        let timeout = self.settings.call_timeout;
        let page_size = self.settings.page_size;
        let api = self.api.as_ref();

        calls.fetch_add(1, Ordering::SeqCst);
        let FetchedPage { ids, next } = match relationship {
            Relationship::Friend => {
                bounded(timeout, cancel, fetch_friends_page(api, &mut job.node, cursor, page_size)).await?
            }
            _ => bounded(timeout, cancel, fetch_followers_page(api, &mut job.node, cursor, page_size)).await?,
        };

        let children: Vec<ChildTask> = ids
            .iter()
            .map(|id| ChildTask::discovered(&key, id.clone(), relationship))
            .collect();
        for batch in children.chunks(self.settings.write_batch_size) {
            bounded(timeout, cancel, self.store.put_children(batch)).await?;
        }

        let status = match relationship {
            Relationship::Friend => {
                job.friends_cursor = next;
                format!("Fetched {} friend IDs", ids.len())
            }
            _ => {
                job.followers_cursor = next;
                format!("Fetched {} follower IDs", ids.len())
            }
        };
        job.status = status.clone();
        bounded(timeout, cancel, self.store.put_job(&job)).await?;
        Ok(status)
    }

    /// Record how many distinct children need hydrating.
    async fn count(&self, mut job: Job, cancel: &CancellationToken) -> Result<String> {
        let remaining = job.distinct_child_count();
        job.remaining = Some(remaining);
        job.status = format!("Enqueued {} handles", remaining);
        bounded(self.settings.call_timeout, cancel, self.store.put_job(&job)).await?;
        Ok(job.status)
    }

    /// Hydrate one pending child inside a store transaction.
    ///
    /// The job is re-read inside the transaction, and the transaction
    /// conflicts if another tick hydrated the same child or touched the
    /// job first, so `remaining` is decremented once per child.
    async fn hydrate(&self, job: Job, cancel: &CancellationToken, calls: &AtomicU32) -> Result<String> {
        let key = job.key();
        let counter = Arc::new(AtomicU32::new(0));

        let outcome = run_transaction(self.store.as_ref(), |tx| {
            let key = key.clone();
            let api = Arc::clone(&self.api);
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                let timeout = settings.call_timeout;
                let mut job = bounded(timeout, &cancel, tx.get_job(&key))
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("job {}", key)))?;
                match job.phase() {
                    Phase::Done => return Err(AppError::AlreadyComplete(key.root_id.clone())),
                    Phase::PreparingOutput => return Ok(PREPARING_GRAPH.to_string()),
                    _ => {}
                }

                let Some(mut child) = bounded(timeout, &cancel, tx.pending_child(&key)).await? else {
                    job.begin_output();
                    job.status = PREPARING_GRAPH.to_string();
                    tx.put_job(job);
                    return Ok(PREPARING_GRAPH.to_string());
                };

                counter.fetch_add(1, Ordering::SeqCst);
                let profile =
                    bounded(timeout, &cancel, lookup_or_placeholder(api.as_ref(), &child.node.id)).await?;

                if settings.expands(profile.friends_count) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    bounded(
                        timeout,
                        &cancel,
                        fetch_friends_page(api.as_ref(), &mut child.node, Cursor::Start, settings.page_size),
                    )
                    .await?;
                }
                if settings.expands(profile.followers_count) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    bounded(
                        timeout,
                        &cancel,
                        fetch_followers_page(api.as_ref(), &mut child.node, Cursor::Start, settings.page_size),
                    )
                    .await?;
                }

                child.node.hydrate(&profile);
                let status = format!("Fetched {}", child.node.display_name);
                job.child_hydrated();
                job.status = status.clone();
                tx.put_child(child);
                tx.put_job(job);
                Ok(status)
            })
        })
        .await;

        calls.fetch_add(counter.load(Ordering::SeqCst), Ordering::SeqCst);
        outcome
    }
}
