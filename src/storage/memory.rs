//! Document store with optimistic transactions.
//!
//! Every document carries a version stamped from a store-wide clock.
//! Transactions remember the version of each document they read and
//! refuse to commit if any of them moved, which is what lets two
//! concurrent hydration ticks race safely: the loser re-runs against the
//! winner's writes.
//!
//! [`MemoryStore::new`] keeps everything in process memory. A store opened
//! on a [`SnapshotBackend`] holds no state between operations: each read
//! loads the current snapshot, and each write loads it, applies the change
//! and swaps it back only if nobody else swapped in between, starting over
//! otherwise. Versions and read marks therefore hold across every process
//! sharing the snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{ChildKey, ChildTask, Job, JobKey};
use crate::storage::local::LocalSnapshot;
use crate::storage::{DocumentStore, JobOrder, JobQuery, MAX_BATCH_WRITES, SnapshotBackend, Transaction};

/// Load-apply-swap rounds a single write gets before it gives up.
const SWAP_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Versioned<T> {
    version: u64,
    doc: T,
}

#[derive(Debug, Default)]
struct State {
    clock: u64,
    jobs: BTreeMap<JobKey, Versioned<Job>>,
    children: BTreeMap<ChildKey, Versioned<ChildTask>>,
}

/// On-disk form of [`State`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    clock: u64,
    jobs: Vec<Versioned<Job>>,
    children: Vec<Versioned<ChildTask>>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn job_version(&self, key: &JobKey) -> u64 {
        self.jobs.get(key).map_or(0, |v| v.version)
    }

    fn child_version(&self, key: &ChildKey) -> u64 {
        self.children.get(key).map_or(0, |v| v.version)
    }

    fn children_of<'a>(&'a self, job: &'a JobKey) -> impl Iterator<Item = &'a Versioned<ChildTask>> + 'a {
        let start = ChildKey {
            owner_id: job.owner_id.clone(),
            root_id: job.root_id.clone(),
            child_id: String::new(),
        };
        self.children
            .range(start..)
            .take_while(move |(key, _)| key.is_under(job))
            .map(|(_, v)| v)
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            clock: self.clock,
            jobs: self.jobs.values().cloned().collect(),
            children: self.children.values().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            clock: snapshot.clock,
            jobs: snapshot.jobs.into_iter().map(|v| (v.doc.key(), v)).collect(),
            children: snapshot.children.into_iter().map(|v| (v.doc.key(), v)).collect(),
        }
    }
}

/// Document store in process memory, optionally backed by a shared snapshot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    backend: Option<Arc<dyn SnapshotBackend>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store on a local snapshot file. Processes opening the same
    /// path share it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_backend(Arc::new(LocalSnapshot::new(path))).await
    }

    /// Open a store on `backend`. The snapshot is loaded once up front so
    /// unreadable state fails here rather than on the first tick.
    pub async fn with_backend(backend: Arc<dyn SnapshotBackend>) -> Result<Self> {
        let location = backend.location();
        let store = Self {
            backend: Some(backend),
            ..Self::default()
        };
        let jobs = store.read(|state| state.jobs.len()).await?;
        log::info!("Opened store at {} ({} jobs)", location, jobs);
        Ok(store)
    }

    /// Make every subsequent write fail with a persistence error until
    /// switched off again. Used to exercise recovery paths.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::persistence("store is rejecting writes"));
        }
        Ok(())
    }

    fn check_batch(size: usize) -> Result<()> {
        if size > MAX_BATCH_WRITES {
            return Err(AppError::BatchTooLarge {
                size,
                limit: MAX_BATCH_WRITES,
            });
        }
        Ok(())
    }

    async fn load(backend: &dyn SnapshotBackend) -> Result<(State, Option<String>)> {
        match backend.load().await? {
            Some((bytes, revision)) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                Ok((State::from_snapshot(snapshot), Some(revision)))
            }
            None => Ok((State::default(), None)),
        }
    }

    /// Run `f` against the current state.
    async fn read<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&State) -> T + Send,
    {
        let mut state = self.state.lock().await;
        if let Some(backend) = &self.backend {
            *state = Self::load(backend.as_ref()).await?.0;
        }
        Ok(f(&*state))
    }

    /// Apply `f` and make the result durable.
    ///
    /// With a backend, `f` runs once per load-apply-swap round against a
    /// freshly loaded state, so it must do its checks before it mutates.
    async fn write<T, F>(&self, mut f: F) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut State) -> Result<T> + Send,
    {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let Some(backend) = &self.backend else {
            return f(&mut *state);
        };

        for attempt in 1..=SWAP_ATTEMPTS {
            let (mut fresh, revision) = Self::load(backend.as_ref()).await?;
            let value = f(&mut fresh)?;
            let bytes = serde_json::to_vec(&fresh.to_snapshot())?;
            if backend.swap(&bytes, revision.as_deref()).await? {
                *state = fresh;
                return Ok(value);
            }
            log::debug!(
                "Snapshot {} changed by another writer (attempt {}), reloading",
                backend.location(),
                attempt
            );
        }
        Err(AppError::Conflict(backend.location()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_job(&self, key: &JobKey) -> Result<Option<Job>> {
        self.read(|state| state.jobs.get(key).map(|v| v.doc.clone())).await
    }

    async fn put_job(&self, job: &Job) -> Result<()> {
        self.write(|state| {
            let version = state.tick();
            state.jobs.insert(
                job.key(),
                Versioned {
                    version,
                    doc: job.clone(),
                },
            );
            Ok(())
        })
        .await
    }

    async fn update_status(&self, key: &JobKey, status: &str) -> Result<()> {
        self.write(|state| {
            let version = state.clock + 1;
            let entry = state
                .jobs
                .get_mut(key)
                .ok_or_else(|| AppError::not_found(format!("job {}", key)))?;
            entry.doc.status = status.to_string();
            entry.version = version;
            state.clock = version;
            Ok(())
        })
        .await
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .read(|state| {
                state
                    .jobs
                    .values()
                    .map(|v| &v.doc)
                    .filter(|job| query.owner_id.as_ref().is_none_or(|owner| &job.owner_id == owner))
                    .filter(|job| query.done.is_none_or(|done| job.done == done))
                    .cloned()
                    .collect()
            })
            .await?;

        match query.order {
            JobOrder::CreatedAt => {
                jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key().cmp(&b.key())))
            }
            JobOrder::DisplayName => jobs.sort_by(|a, b| {
                a.node
                    .display_name
                    .cmp(&b.node.display_name)
                    .then_with(|| a.node.id.cmp(&b.node.id))
            }),
        }
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn delete_job(&self, key: &JobKey) -> Result<()> {
        self.write(|state| {
            state.tick();
            state.jobs.remove(key);
            Ok(())
        })
        .await
    }

    async fn put_children(&self, children: &[ChildTask]) -> Result<()> {
        Self::check_batch(children.len())?;
        self.write(|state| {
            let version = state.tick();
            for child in children {
                state.children.insert(
                    child.key(),
                    Versioned {
                        version,
                        doc: child.clone(),
                    },
                );
            }
            Ok(())
        })
        .await
    }

    async fn query_children(&self, job: &JobKey, hydrated: Option<bool>) -> Result<Vec<ChildTask>> {
        self.read(|state| {
            state
                .children_of(job)
                .map(|v| &v.doc)
                .filter(|child| hydrated.is_none_or(|h| child.node.hydrated == h))
                .cloned()
                .collect()
        })
        .await
    }

    async fn count_children(&self, job: &JobKey, hydrated: Option<bool>) -> Result<usize> {
        self.read(|state| {
            state
                .children_of(job)
                .filter(|v| hydrated.is_none_or(|h| v.doc.node.hydrated == h))
                .count()
        })
        .await
    }

    async fn child_keys(&self, job: &JobKey) -> Result<Vec<ChildKey>> {
        self.read(|state| state.children_of(job).map(|v| v.doc.key()).collect())
            .await
    }

    async fn delete_children(&self, keys: &[ChildKey]) -> Result<()> {
        Self::check_batch(keys.len())?;
        self.write(|state| {
            state.tick();
            for key in keys {
                state.children.remove(key);
            }
            Ok(())
        })
        .await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            reads: Vec::new(),
            job_writes: Vec::new(),
            child_writes: Vec::new(),
        }))
    }
}

#[derive(Debug)]
enum ReadMark {
    Job(JobKey, u64),
    Child(ChildKey, u64),
}

/// Transaction over a [`MemoryStore`].
struct MemoryTransaction {
    store: MemoryStore,
    reads: Vec<ReadMark>,
    job_writes: Vec<Job>,
    child_writes: Vec<ChildTask>,
}

fn written_job<'a>(writes: &'a [Job], key: &JobKey) -> Option<&'a Job> {
    writes.iter().rev().find(|job| &job.key() == key)
}

fn written_child<'a>(writes: &'a [ChildTask], key: &ChildKey) -> Option<&'a ChildTask> {
    writes.iter().rev().find(|child| &child.key() == key)
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_job(&mut self, key: &JobKey) -> Result<Option<Job>> {
        if let Some(job) = written_job(&self.job_writes, key) {
            return Ok(Some(job.clone()));
        }
        let (found, version) = self
            .store
            .read(|state| (state.jobs.get(key).map(|v| v.doc.clone()), state.job_version(key)))
            .await?;
        self.reads.push(ReadMark::Job(key.clone(), version));
        Ok(found)
    }

    async fn pending_child(&mut self, job: &JobKey) -> Result<Option<ChildTask>> {
        let writes = &self.child_writes;
        let candidate = self
            .store
            .read(|state| {
                state
                    .children_of(job)
                    .find(|v| {
                        !v.doc.node.hydrated
                            && written_child(writes, &v.doc.key()).is_none_or(|written| !written.node.hydrated)
                    })
                    .map(|v| (v.doc.clone(), v.version))
            })
            .await?;

        let Some((child, version)) = candidate else {
            return Ok(None);
        };
        let key = child.key();
        self.reads.push(ReadMark::Child(key.clone(), version));
        Ok(Some(written_child(&self.child_writes, &key).cloned().unwrap_or(child)))
    }

    fn put_job(&mut self, job: Job) {
        self.job_writes.push(job);
    }

    fn put_child(&mut self, child: ChildTask) {
        self.child_writes.push(child);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            store,
            reads,
            job_writes,
            child_writes,
        } = *self;

        if job_writes.is_empty() && child_writes.is_empty() {
            return Ok(());
        }

        store
            .write(|state| {
                for mark in &reads {
                    let (doc, seen, current) = match mark {
                        ReadMark::Job(key, seen) => (key.to_string(), *seen, state.job_version(key)),
                        ReadMark::Child(key, seen) => (
                            format!("{}/{}", key.job(), key.child_id),
                            *seen,
                            state.child_version(key),
                        ),
                    };
                    if seen != current {
                        return Err(AppError::Conflict(doc));
                    }
                }

                let version = state.tick();
                for job in &job_writes {
                    state.jobs.insert(
                        job.key(),
                        Versioned {
                            version,
                            doc: job.clone(),
                        },
                    );
                }
                for child in &child_writes {
                    state.children.insert(
                        child.key(),
                        Versioned {
                            version,
                            doc: child.clone(),
                        },
                    );
                }
                Ok(())
            })
            .await
    }
}
