// src/pipeline/driver.rs

//! Invocation driver: selects jobs and ticks each of them once.
//!
//! Every invocation is short-lived and stateless. Before ticking, the
//! driver takes a per-job lease and checks the job's token bucket inside a
//! store transaction; after the tick it charges the calls made and gives
//! the lease back. Failures are caught per job and never abort siblings.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{AccessConfig, Config, Job, JobKey, Lease};
use crate::pipeline::throttle::Throttle;
use crate::pipeline::tick::TickEngine;
use crate::storage::{DocumentStore, JobQuery, run_transaction};
use crate::utils::{bounded, mint_lease_token};

pub const NOTHING_TO_DO: &str = "Nothing to do";
pub const JOB_BUSY: &str = "Job busy";
pub const THROTTLED: &str = "Throttled";

/// Owners allowed to drive ticks by hand and to see internal details.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    admins: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &AccessConfig) -> Self {
        Self::new(config.admins.iter().cloned())
    }

    pub fn is_admin(&self, owner_id: &str) -> bool {
        self.admins.contains(owner_id)
    }
}

/// Who triggered an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// The periodic trigger; subject to throttling
    Scheduler,
    /// A signed-in user; must be an admin, bypasses throttling
    User(String),
}

/// Which jobs an invocation should advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Exactly this job; `NotFound` if it doesn't exist
    Job(JobKey),
    /// The owner's oldest unfinished job
    Owner(String),
    /// The oldest unfinished job of every owner
    All,
}

impl Target {
    /// Target from optional owner and root addressing.
    pub fn from_address(owner_id: Option<String>, root_id: Option<String>) -> Result<Self> {
        match (owner_id, root_id) {
            (Some(owner), Some(root)) => Ok(Target::Job(JobKey::new(owner, root))),
            (Some(owner), None) => Ok(Target::Owner(owner)),
            (None, None) => Ok(Target::All),
            (None, Some(_)) => Err(AppError::validation("root id given without an owner id")),
        }
    }
}

/// What happened to one selected job.
#[derive(Debug)]
pub enum JobResult {
    Updated(String),
    Skipped(&'static str),
    Failed(AppError),
}

#[derive(Debug)]
pub struct JobReport {
    pub key: JobKey,
    pub result: JobResult,
}

impl JobReport {
    /// Human-readable report line.
    pub fn line(&self) -> String {
        match &self.result {
            JobResult::Updated(status) => format!("Updated {}: {}", self.key.owner_id, status),
            JobResult::Skipped(reason) => format!("Skipped {}: {}", self.key.owner_id, reason),
            JobResult::Failed(e) => worker_error(&self.key.owner_id, e),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, JobResult::Failed(_))
    }
}

fn worker_error(owner_id: &str, error: &AppError) -> String {
    format!("worker error: ({}) {}", owner_id, error)
}

/// Result of one driver invocation.
#[derive(Debug)]
pub enum Invocation {
    /// No unfinished job matched; nothing was written
    NothingToDo,
    Ran(Vec<JobReport>),
}

impl Invocation {
    pub fn lines(&self) -> Vec<String> {
        match self {
            Invocation::NothingToDo => vec![NOTHING_TO_DO.to_string()],
            Invocation::Ran(reports) => reports.iter().map(JobReport::line).collect(),
        }
    }

    pub fn reports(&self) -> &[JobReport] {
        match self {
            Invocation::NothingToDo => &[],
            Invocation::Ran(reports) => reports,
        }
    }
}

enum Acquired {
    Job(Job),
    Skip(&'static str),
}

/// Advances selected jobs through the [`TickEngine`].
pub struct Driver {
    store: Arc<dyn DocumentStore>,
    engine: TickEngine,
    policy: AccessPolicy,
    throttle: Throttle,
    lease_ttl: chrono::Duration,
    max_concurrent: usize,
    call_timeout: Duration,
}

impl Driver {
    pub fn new(config: &Config, store: Arc<dyn DocumentStore>, engine: TickEngine, policy: AccessPolicy) -> Self {
        Self {
            store,
            engine,
            policy,
            throttle: Throttle::new(&config.throttle),
            lease_ttl: chrono::Duration::seconds(config.lease.ttl_secs as i64),
            max_concurrent: config.crawler.max_concurrent.max(1),
            call_timeout: config.crawler.call_timeout(),
        }
    }

    /// Advance every job `target` selects by one tick.
    ///
    /// Fails only when the caller is not allowed or the selection itself
    /// fails; per-job failures are part of the returned report.
    pub async fn run(&self, caller: &Caller, target: Target, cancel: &CancellationToken) -> Result<Invocation> {
        let forced = match caller {
            Caller::Scheduler => false,
            Caller::User(owner) if self.policy.is_admin(owner) => true,
            Caller::User(owner) => {
                return Err(AppError::Unauthorized(format!("{} may not drive ticks", owner)));
            }
        };

        let jobs = self.select(target, cancel).await?;
        if jobs.first().is_none_or(|job| job.done) {
            log::info!("{}", NOTHING_TO_DO);
            return Ok(Invocation::NothingToDo);
        }

        log::info!("Advancing {} job(s)", jobs.len());
        let reports: Vec<JobReport> = stream::iter(jobs)
            .map(|job| self.advance(job, forced, cancel))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for report in &reports {
            if report.is_failure() {
                log::warn!("{}", report.line());
            } else {
                log::info!("{}", report.line());
            }
        }
        Ok(Invocation::Ran(reports))
    }

    async fn select(&self, target: Target, cancel: &CancellationToken) -> Result<Vec<Job>> {
        let timeout = self.call_timeout;
        match target {
            Target::Job(key) => {
                let job = bounded(timeout, cancel, self.store.get_job(&key))
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("job {}", key)))?;
                Ok(vec![job])
            }
            Target::Owner(owner) => {
                bounded(timeout, cancel, self.store.query_jobs(&JobQuery::unfinished().owner(owner).limit(1))).await
            }
            Target::All => {
                let unfinished = bounded(timeout, cancel, self.store.query_jobs(&JobQuery::unfinished())).await?;
                let mut per_owner: BTreeMap<String, Job> = BTreeMap::new();
                for job in unfinished {
                    per_owner.entry(job.owner_id.clone()).or_insert(job);
                }
                Ok(per_owner.into_values().collect())
            }
        }
    }

    /// Lease, tick and release one job, reporting instead of failing.
    async fn advance(&self, job: Job, forced: bool, cancel: &CancellationToken) -> JobReport {
        let key = job.key();
        let token = mint_lease_token();

        let job = match self.acquire(&key, &token, forced, cancel).await {
            Ok(Acquired::Job(job)) => job,
            Ok(Acquired::Skip(reason)) => {
                return JobReport {
                    key,
                    result: JobResult::Skipped(reason),
                };
            }
            Err(e) => {
                return JobReport {
                    key,
                    result: JobResult::Failed(e),
                };
            }
        };

        // The tick must not outlive its lease, or a second worker could take
        // the job while this one is still writing.
        let lease_left = job
            .lease
            .as_ref()
            .and_then(|lease| (lease.expires_at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let ticked = bounded(lease_left, cancel, self.engine.tick_counted(job, cancel, &calls)).await;

        if let Err(e) = self.release(&key, &token, calls.load(Ordering::SeqCst)).await {
            log::warn!("Failed to release lease on {}: {}", key, e);
        }

        let result = match ticked {
            Ok(status) => JobResult::Updated(status),
            Err(e) => {
                if !matches!(e, AppError::AlreadyComplete(_) | AppError::NotFound(_)) {
                    self.record_failure(&key, &e).await;
                }
                JobResult::Failed(e)
            }
        };
        JobReport { key, result }
    }

    /// Take the lease and check the token bucket in one transaction.
    async fn acquire(&self, key: &JobKey, token: &str, forced: bool, cancel: &CancellationToken) -> Result<Acquired> {
        let throttle = self.throttle.clone();
        let lease_ttl = self.lease_ttl;

        bounded(
            self.call_timeout,
            cancel,
            run_transaction(self.store.as_ref(), |tx| {
                let key = key.clone();
                let token = token.to_string();
                let throttle = throttle.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    let mut job = tx
                        .get_job(&key)
                        .await?
                        .ok_or_else(|| AppError::not_found(format!("job {}", key)))?;
                    if job.done {
                        return Err(AppError::AlreadyComplete(key.root_id.clone()));
                    }
                    if job.lease.as_ref().is_some_and(|lease| lease.blocks(&token, now)) {
                        return Ok(Acquired::Skip(JOB_BUSY));
                    }
                    if !forced && throttle.enabled() {
                        match throttle.admit(job.budget.as_ref(), now) {
                            Ok(budget) => job.budget = Some(budget),
                            Err(wait) => {
                                log::debug!("Job {} throttled for another {}s", key, wait);
                                return Ok(Acquired::Skip(THROTTLED));
                            }
                        }
                    }
                    job.lease = Some(Lease {
                        token,
                        expires_at: now + lease_ttl,
                    });
                    tx.put_job(job.clone());
                    Ok(Acquired::Job(job))
                })
            }),
        )
        .await
    }

    /// Give the lease back and charge the calls the tick made.
    ///
    /// Not tied to the invocation's cancellation token, so a cancelled
    /// tick still releases its lease.
    async fn release(&self, key: &JobKey, token: &str, calls: u32) -> Result<()> {
        let throttle = self.throttle.clone();
        let detached = CancellationToken::new();

        bounded(
            self.call_timeout,
            &detached,
            run_transaction(self.store.as_ref(), |tx| {
                let key = key.clone();
                let token = token.to_string();
                let throttle = throttle.clone();
                Box::pin(async move {
                    let Some(mut job) = tx.get_job(&key).await? else {
                        return Ok(());
                    };
                    if job.lease.as_ref().is_none_or(|lease| lease.token != token) {
                        return Ok(());
                    }
                    job.lease = None;
                    if throttle.enabled() && calls > 0 {
                        job.budget = Some(throttle.charge(job.budget.as_ref(), calls, Utc::now()));
                    }
                    tx.put_job(job);
                    Ok(())
                })
            }),
        )
        .await
    }

    /// Best-effort status write so the owner can see the last error.
    async fn record_failure(&self, key: &JobKey, error: &AppError) {
        let message = worker_error(&key.owner_id, error);
        let cancel = CancellationToken::new();
        if let Err(e) = bounded(self.call_timeout, &cancel, self.store.update_status(key, &message)).await {
            log::warn!("Failed to record status for {}: {}", key, e);
        }
    }
}
