//! Shared fixtures for integration tests: a scripted upstream API and a
//! fully wired app over an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use graph_crawler::app::App;
use graph_crawler::error::{AppError, Result, Unavailable};
use graph_crawler::models::{Config, Profile};
use graph_crawler::pipeline::{TickEngine, TickSettings};
use graph_crawler::services::{GraphApi, IdPage};
use graph_crawler::storage::{LocalBlobStore, MemoryStore};
use tempfile::TempDir;
use tokio::sync::Barrier;

pub fn profile(id: &str, name: &str, friends: u64, followers: u64) -> Profile {
    Profile {
        id: id.to_string(),
        screen_name: name.to_string(),
        url: format!("https://example.com/{name}"),
        description: format!("about {name}"),
        profile_image_url: format!("https://example.com/{name}.png"),
        friends_count: friends,
        followers_count: followers,
    }
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// In-memory upstream with scripted profiles and id pages.
///
/// Pages that were not scripted come back empty and exhausted.
#[derive(Default)]
pub struct FakeApi {
    profiles: Mutex<HashMap<String, Profile>>,
    unavailable: Mutex<HashMap<String, Unavailable>>,
    follower_pages: Mutex<HashMap<(String, i64), IdPage>>,
    friend_pages: Mutex<HashMap<(String, i64), IdPage>>,
    lookup_barrier: Mutex<Option<Arc<Barrier>>>,
    pub lookups: AtomicUsize,
    pub follower_calls: AtomicUsize,
    pub friend_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_profile(&self, profile: Profile) {
        self.profiles.lock().unwrap().insert(profile.id.clone(), profile);
    }

    pub fn set_unavailable(&self, id: &str, reason: Unavailable) {
        self.unavailable.lock().unwrap().insert(id.to_string(), reason);
    }

    pub fn followers_page(&self, id: &str, cursor: i64, page: &[&str], next_cursor: i64) {
        self.follower_pages.lock().unwrap().insert(
            (id.to_string(), cursor),
            IdPage {
                ids: ids(page),
                next_cursor,
            },
        );
    }

    pub fn friends_page(&self, id: &str, cursor: i64, page: &[&str], next_cursor: i64) {
        self.friend_pages.lock().unwrap().insert(
            (id.to_string(), cursor),
            IdPage {
                ids: ids(page),
                next_cursor,
            },
        );
    }

    /// Make every id lookup wait until `parties` lookups are in flight.
    pub fn hold_lookups(&self, parties: usize) {
        *self.lookup_barrier.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    pub fn release_lookups(&self) {
        *self.lookup_barrier.lock().unwrap() = None;
    }

    pub fn total_calls(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
            + self.follower_calls.load(Ordering::SeqCst)
            + self.friend_calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &str) -> Result<Profile> {
        if let Some(reason) = self.unavailable.lock().unwrap().get(key) {
            return Err(AppError::AccountUnavailable {
                account: key.to_string(),
                reason: *reason,
            });
        }
        let profiles = self.profiles.lock().unwrap();
        profiles
            .get(key)
            .or_else(|| profiles.values().find(|p| p.screen_name == key))
            .cloned()
            .ok_or_else(|| AppError::upstream(format!("no scripted profile for {key}")))
    }

    fn page(pages: &Mutex<HashMap<(String, i64), IdPage>>, id: &str, cursor: i64) -> IdPage {
        pages
            .lock()
            .unwrap()
            .get(&(id.to_string(), cursor))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl GraphApi for FakeApi {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Profile> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.lookup(handle)
    }

    async fn lookup_by_id(&self, id: &str) -> Result<Profile> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let barrier = self.lookup_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        self.lookup(id)
    }

    async fn friend_ids(&self, id: &str, cursor: i64, _page_size: u32) -> Result<IdPage> {
        self.friend_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::page(&self.friend_pages, id, cursor))
    }

    async fn follower_ids(&self, id: &str, cursor: i64, _page_size: u32) -> Result<IdPage> {
        self.follower_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::page(&self.follower_pages, id, cursor))
    }
}

/// Configuration for tests: throttling off, one admin.
pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.throttle.enabled = false;
    config.storage.data_dir = data_dir.to_path_buf();
    config.access.admins = vec!["admin".to_string()];
    config
}

pub struct Harness {
    pub app: App,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub api: Arc<FakeApi>,
    pub engine: TickEngine,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(api: Arc<FakeApi>) -> Self {
        Self::with_config(api, |_| {})
    }

    pub fn with_config(api: Arc<FakeApi>, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(LocalBlobStore::new(dir.path()));
        let engine = TickEngine::new(
            store.clone(),
            blobs.clone(),
            api.clone(),
            TickSettings::from_config(&config),
        );
        let app = App::assemble(config, store.clone(), blobs.clone(), api.clone());
        Self {
            app,
            store,
            blobs,
            api,
            engine,
            dir,
        }
    }
}
