mod common;

use chrono::{Duration, Utc};
use common::{FakeApi, Harness, ids, profile};
use graph_crawler::error::AppError;
use graph_crawler::models::{ChildTask, Cursor, Job, JobKey, Lease, Relationship};
use graph_crawler::pipeline::{Caller, Invocation, JobResult, Target};
use graph_crawler::storage::DocumentStore;
use tokio_util::sync::CancellationToken;

async fn put_fresh(h: &Harness, owner: &str, root: &str, age_minutes: i64) -> JobKey {
    let job = Job::new(owner, &profile(root, root, 0, 1), Utc::now() - Duration::minutes(age_minutes));
    h.store.put_job(&job).await.unwrap();
    job.key()
}

/// A job with one child left to hydrate.
async fn put_hydrating(h: &Harness, owner: &str, child: &str) -> JobKey {
    let mut job = Job::new(owner, &profile("100", "root", 0, 1), Utc::now());
    job.node.follower_ids = ids(&[child]);
    job.followers_cursor = Cursor::Exhausted;
    job.remaining = Some(1);
    h.store.put_job(&job).await.unwrap();
    let key = job.key();
    h.store
        .put_children(&[ChildTask::discovered(&key, child, Relationship::Follower)])
        .await
        .unwrap();
    key
}

async fn run(h: &Harness, caller: Caller, target: Target) -> Invocation {
    h.app.driver.run(&caller, target, &CancellationToken::new()).await.unwrap()
}

#[tokio::test]
async fn test_nothing_to_do_without_jobs() {
    let h = Harness::new(FakeApi::new());

    let invocation = run(&h, Caller::Scheduler, Target::All).await;
    assert!(matches!(invocation, Invocation::NothingToDo));
    assert_eq!(invocation.lines(), vec!["Nothing to do"]);

    let invocation = run(&h, Caller::Scheduler, Target::Owner("nobody".into())).await;
    assert!(matches!(invocation, Invocation::NothingToDo));
    assert_eq!(h.api.total_calls(), 0);
}

#[tokio::test]
async fn test_missing_job_is_not_found() {
    let h = Harness::new(FakeApi::new());
    let err = h
        .app
        .driver
        .run(&Caller::Scheduler, Target::Job(JobKey::new("u1", "404")), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_non_admin_user_is_rejected() {
    let h = Harness::new(FakeApi::new());
    put_fresh(&h, "u1", "1", 0).await;

    let err = h
        .app
        .driver
        .run(&Caller::User("mallory".into()), Target::All, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));
    assert_eq!(h.api.total_calls(), 0);

    let invocation = run(&h, Caller::User("admin".into()), Target::All).await;
    assert_eq!(invocation.lines(), vec!["Updated u1: Fetched 0 follower IDs"]);
}

#[tokio::test]
async fn test_one_job_per_owner_oldest_first() {
    let h = Harness::new(FakeApi::new());
    let older = put_fresh(&h, "u1", "1", 10).await;
    let newer = put_fresh(&h, "u1", "2", 1).await;
    let other = put_fresh(&h, "u2", "3", 5).await;

    let invocation = run(&h, Caller::Scheduler, Target::All).await;
    let mut ticked: Vec<JobKey> = invocation.reports().iter().map(|r| r.key.clone()).collect();
    ticked.sort();
    assert_eq!(ticked, vec![older.clone(), other]);

    let untouched = h.store.get_job(&newer).await.unwrap().unwrap();
    assert_eq!(untouched.followers_cursor, Cursor::Start);

    let invocation = run(&h, Caller::Scheduler, Target::Owner("u1".into())).await;
    assert_eq!(invocation.reports().len(), 1);
    assert_eq!(invocation.reports()[0].key, older);
}

#[tokio::test]
async fn test_done_jobs_are_not_selected() {
    let h = Harness::new(FakeApi::new());
    let mut done = Job::new("u1", &profile("1", "one", 0, 0), Utc::now());
    done.finish("digest".into());
    h.store.put_job(&done).await.unwrap();

    let invocation = run(&h, Caller::Scheduler, Target::Owner("u1".into())).await;
    assert!(matches!(invocation, Invocation::NothingToDo));

    let invocation = run(&h, Caller::Scheduler, Target::Job(done.key())).await;
    assert!(matches!(invocation, Invocation::NothingToDo));
    assert_eq!(h.store.get_job(&done.key()).await.unwrap().unwrap(), done);
}

#[tokio::test]
async fn test_live_lease_skips_job() {
    let h = Harness::new(FakeApi::new());
    let mut job = Job::new("u1", &profile("1", "one", 0, 1), Utc::now());
    job.lease = Some(Lease {
        token: "another-worker".into(),
        expires_at: Utc::now() + Duration::seconds(60),
    });
    h.store.put_job(&job).await.unwrap();

    let invocation = run(&h, Caller::Scheduler, Target::Job(job.key())).await;
    assert_eq!(invocation.lines(), vec!["Skipped u1: Job busy"]);
    assert_eq!(h.api.total_calls(), 0);

    // an expired lease no longer blocks
    job.lease = Some(Lease {
        token: "another-worker".into(),
        expires_at: Utc::now() - Duration::seconds(1),
    });
    h.store.put_job(&job).await.unwrap();
    let invocation = run(&h, Caller::Scheduler, Target::Job(job.key())).await;
    assert!(matches!(invocation.reports()[0].result, JobResult::Updated(_)));

    let stored = h.store.get_job(&job.key()).await.unwrap().unwrap();
    assert!(stored.lease.is_none());
}

#[tokio::test]
async fn test_throttle_limits_scheduler_but_not_admin() {
    let h = Harness::with_config(FakeApi::new(), |config| {
        config.throttle.enabled = true;
        config.throttle.calls_per_window = 1;
        config.throttle.window_secs = 900;
    });
    let key = put_fresh(&h, "u1", "1", 0).await;
    let target = || Target::Job(key.clone());

    let first = run(&h, Caller::Scheduler, target()).await;
    assert!(matches!(first.reports()[0].result, JobResult::Updated(_)));
    let budget = h.store.get_job(&key).await.unwrap().unwrap().budget.unwrap();
    assert!(budget.tokens < 0.1);

    let second = run(&h, Caller::Scheduler, target()).await;
    assert_eq!(second.lines(), vec!["Skipped u1: Throttled"]);
    assert_eq!(h.api.total_calls(), 1);

    let forced = run(&h, Caller::User("admin".into()), target()).await;
    assert!(matches!(forced.reports()[0].result, JobResult::Updated(_)));
    assert_eq!(h.api.total_calls(), 2);
}

#[tokio::test]
async fn test_failure_is_reported_and_recorded() {
    let h = Harness::new(FakeApi::new());
    let key = put_hydrating(&h, "u1", "9").await;

    let invocation = run(&h, Caller::Scheduler, Target::Job(key.clone())).await;
    let expected = "worker error: (u1) Upstream error: no scripted profile for 9";
    assert_eq!(invocation.lines(), vec![expected]);
    assert!(invocation.reports()[0].is_failure());

    let stored = h.store.get_job(&key).await.unwrap().unwrap();
    assert_eq!(stored.status, expected);
    assert_eq!(stored.remaining, Some(1));
    assert!(stored.lease.is_none());
    assert_eq!(h.store.count_children(&key, Some(false)).await.unwrap(), 1);
}

#[tokio::test]
async fn test_failure_does_not_abort_other_owners() {
    let api = FakeApi::new();
    api.add_profile(profile("7", "seven", 0, 0));
    let h = Harness::new(api);
    let failing = put_hydrating(&h, "u1", "9").await;
    let healthy = put_hydrating(&h, "u2", "7").await;

    let invocation = run(&h, Caller::Scheduler, Target::All).await;
    let mut lines = invocation.lines();
    lines.sort();
    assert_eq!(
        lines,
        vec![
            "Updated u2: Fetched seven",
            "worker error: (u1) Upstream error: no scripted profile for 9",
        ]
    );

    assert_eq!(h.store.get_job(&healthy).await.unwrap().unwrap().remaining, Some(0));
    assert_eq!(h.store.get_job(&failing).await.unwrap().unwrap().remaining, Some(1));
}

#[tokio::test]
async fn test_cancelled_invocation_releases_nothing_it_did_not_take() {
    let h = Harness::new(FakeApi::new());
    let key = put_fresh(&h, "u1", "1", 0).await;
    let before = h.store.get_job(&key).await.unwrap().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.app.driver.run(&Caller::Scheduler, Target::All, &cancel).await.unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert_eq!(h.store.get_job(&key).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_tick_is_cut_off_when_lease_runs_out() {
    let h = Harness::with_config(FakeApi::new(), |config| {
        config.lease.ttl_secs = 1;
        config.crawler.call_timeout_secs = 30;
    });
    let key = put_hydrating(&h, "u1", "9").await;
    // a lone lookup never reaches a two-party barrier
    h.api.hold_lookups(2);

    let invocation = run(&h, Caller::Scheduler, Target::Job(key.clone())).await;
    assert!(matches!(
        invocation.reports()[0].result,
        JobResult::Failed(AppError::Timeout(_))
    ));

    let stored = h.store.get_job(&key).await.unwrap().unwrap();
    assert!(stored.lease.is_none());
    assert!(stored.status.starts_with("worker error: (u1) Timed out after"));
    assert_eq!(stored.remaining, Some(1));
    assert_eq!(h.store.count_children(&key, Some(false)).await.unwrap(), 1);
}
