mod common;

use chrono::Utc;
use common::{FakeApi, Harness, ids, profile};
use graph_crawler::error::{AppError, Unavailable};
use graph_crawler::models::{ChildTask, Cursor, Job, JobKey, MAX_BATCH_WRITES, Relationship};
use graph_crawler::pipeline::{Caller, Target};
use graph_crawler::storage::{BlobStore, DocumentStore, MemoryStore};
use tokio_util::sync::CancellationToken;

async fn tick_until_done(h: &Harness, key: &JobKey) {
    for _ in 0..20 {
        h.app
            .driver
            .run(&Caller::Scheduler, Target::Job(key.clone()), &CancellationToken::new())
            .await
            .unwrap();
        if h.store.get_job(key).await.unwrap().unwrap().done {
            return;
        }
    }
    panic!("job {key} did not finish");
}

#[tokio::test]
async fn test_enqueue_normalizes_handle() {
    let api = FakeApi::new();
    api.add_profile(profile("100", "root", 4, 2));
    let h = Harness::new(api);

    let key = h.app.jobs.enqueue("owner", "  @root ").await.unwrap();
    assert_eq!(key, JobKey::new("owner", "100"));

    let job = h.store.get_job(&key).await.unwrap().unwrap();
    assert_eq!(job.node.display_name, "root");
    assert_eq!(job.node.friend_count, 4);
    assert_eq!(job.node.follower_count, 2);
    assert_eq!(job.remaining, None);
    assert!(!job.done);
}

#[tokio::test]
async fn test_enqueue_rejects_bad_input() {
    let api = FakeApi::new();
    api.set_unavailable("gone", Unavailable::NotFound);
    let h = Harness::new(api);

    let err = h.app.jobs.enqueue("owner", "gone").await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = h.app.jobs.enqueue("owner", " @ ").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = h.app.jobs.enqueue("", "root").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert!(h.app.jobs.list("owner").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reenqueue_keeps_progress() {
    let api = FakeApi::new();
    api.add_profile(profile("100", "root", 0, 2));
    api.followers_page("100", -1, &["1", "2"], 0);
    let h = Harness::new(api);

    let key = h.app.jobs.enqueue("owner", "root").await.unwrap();
    h.app
        .driver
        .run(&Caller::Scheduler, Target::Job(key.clone()), &CancellationToken::new())
        .await
        .unwrap();
    let progressed = h.store.get_job(&key).await.unwrap().unwrap();

    let again = h.app.jobs.enqueue("owner", "root").await.unwrap();
    assert_eq!(again, key);
    assert_eq!(h.store.get_job(&key).await.unwrap().unwrap(), progressed);
    assert_eq!(progressed.followers_cursor, Cursor::Exhausted);
}

#[tokio::test]
async fn test_list_is_scoped_and_sorted_by_name() {
    let api = FakeApi::new();
    api.add_profile(profile("1", "zed", 0, 0));
    api.add_profile(profile("2", "amy", 0, 0));
    api.add_profile(profile("3", "kim", 0, 0));
    let h = Harness::new(api);

    h.app.jobs.enqueue("owner", "zed").await.unwrap();
    h.app.jobs.enqueue("owner", "amy").await.unwrap();
    h.app.jobs.enqueue("someone-else", "kim").await.unwrap();

    let names: Vec<String> = h
        .app
        .jobs
        .list("owner")
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.node.display_name)
        .collect();
    assert_eq!(names, vec!["amy", "zed"]);
}

#[tokio::test]
async fn test_status_hides_internals_from_owner() {
    let api = FakeApi::new();
    api.add_profile(profile("100", "root", 0, 3));
    api.add_profile(profile("1", "one", 0, 0));
    api.followers_page("100", -1, &["1", "2", "3"], 0);
    let h = Harness::new(api);
    let key = h.app.jobs.enqueue("owner", "root").await.unwrap();

    // follower page, count, one hydration
    for _ in 0..3 {
        h.app
            .driver
            .run(&Caller::Scheduler, Target::Job(key.clone()), &CancellationToken::new())
            .await
            .unwrap();
    }

    let status = h.app.jobs.status("owner", &key).await.unwrap();
    assert_eq!(status.display_name, "root");
    assert_eq!(status.enqueued, 3);
    assert_eq!(status.remaining, 2);
    assert_eq!(status.status, "Fetched one");
    assert_eq!(status.phase, "hydrating");
    assert!(!status.done);
    assert!(status.graph_path.is_none());
    assert!(status.root_id.is_none());

    let admin = h.app.jobs.status("admin", &key).await.unwrap();
    assert_eq!(admin.graph_path.as_deref(), Some("graphs/owner/100"));
    assert_eq!(admin.root_id.as_deref(), Some("100"));

    let err = h.app.jobs.status("owner", &JobKey::new("owner", "404")).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_download_requires_finished_job() {
    let api = FakeApi::new();
    api.add_profile(profile("100", "root", 0, 1));
    api.add_profile(profile("1", "one", 0, 0));
    api.followers_page("100", -1, &["1"], 0);
    let h = Harness::new(api);
    let key = h.app.jobs.enqueue("owner", "root").await.unwrap();

    let err = h.app.jobs.download(&key).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    tick_until_done(&h, &key).await;
    let download = h.app.jobs.download(&key).await.unwrap();
    assert_eq!(download.content_disposition, "Attachment; filename=root.gml");
    assert!(download.bytes.starts_with(b"graph [\n  directed 1"));

    let status = h.app.jobs.status("owner", &key).await.unwrap();
    assert!(status.done);
    assert_eq!(status.phase, "done");
    assert_eq!(status.graph_path.as_deref(), Some("graphs/owner/100"));
}

#[tokio::test]
async fn test_download_detects_tampered_file() {
    let api = FakeApi::new();
    api.add_profile(profile("100", "root", 0, 0));
    let h = Harness::new(api);
    let key = h.app.jobs.enqueue("owner", "root").await.unwrap();
    tick_until_done(&h, &key).await;

    h.blobs
        .write("graphs/owner/100", b"graph [\n]\n", "Attachment; filename=root.gml")
        .await
        .unwrap();
    let err = h.app.jobs.download(&key).await.unwrap_err();
    assert!(matches!(err, AppError::Persistence(_)));
}

#[tokio::test]
async fn test_delete_cascades_past_batch_ceiling() {
    let h = Harness::new(FakeApi::new());
    let mut job = Job::new("owner", &profile("100", "root", 0, 1203), Utc::now());
    let child_ids: Vec<String> = (0..1203).map(|n| format!("c{n}")).collect();
    job.node.follower_ids = child_ids.clone();
    job.followers_cursor = Cursor::Exhausted;
    let key = job.key();
    h.store.put_job(&job).await.unwrap();

    let children: Vec<ChildTask> = child_ids
        .iter()
        .map(|id| ChildTask::discovered(&key, id.clone(), Relationship::Follower))
        .collect();
    for batch in children.chunks(MAX_BATCH_WRITES) {
        h.store.put_children(batch).await.unwrap();
    }

    // another job's children must survive
    let neighbour = Job::new("owner", &profile("200", "other", 0, 1), Utc::now());
    h.store.put_job(&neighbour).await.unwrap();
    h.store
        .put_children(&[ChildTask::discovered(&neighbour.key(), "c0", Relationship::Follower)])
        .await
        .unwrap();

    assert_eq!(h.app.jobs.delete(&key).await.unwrap(), 1203);
    assert!(h.store.get_job(&key).await.unwrap().is_none());
    assert_eq!(h.store.count_children(&key, None).await.unwrap(), 0);
    assert_eq!(h.store.count_children(&neighbour.key(), None).await.unwrap(), 1);

    let err = h.app.jobs.delete(&key).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_snapshot_survives_reopen() {
    let h = Harness::new(FakeApi::new());
    let path = h.dir.path().join("jobs.json");

    let store = MemoryStore::open(path.clone()).await.unwrap();
    let mut job = Job::new("owner", &profile("100", "root", 0, 2), Utc::now());
    job.node.follower_ids = ids(&["1", "2"]);
    job.followers_cursor = Cursor::Exhausted;
    store.put_job(&job).await.unwrap();
    drop(store);

    let reopened = MemoryStore::open(path).await.unwrap();
    let stored = reopened.get_job(&job.key()).await.unwrap().unwrap();
    assert_eq!(stored.node.follower_ids, ids(&["1", "2"]));
    assert_eq!(stored.followers_cursor, Cursor::Exhausted);
}
