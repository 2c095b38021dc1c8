// src/app.rs

//! Wiring of stores, upstream client, job service and driver.

use std::sync::Arc;

use crate::error::Result;
use crate::models::Config;
use crate::pipeline::{AccessPolicy, Driver, TickEngine, TickSettings};
use crate::services::{GraphApi, HttpGraphApi, JobService};
use crate::storage::{BlobStore, DocumentStore, LocalBlobStore, MemoryStore};

/// Everything one process needs to serve owners and drive ticks.
pub struct App {
    pub config: Config,
    pub jobs: JobService,
    pub driver: Driver,
}

impl App {
    /// Assemble from explicit collaborators.
    pub fn assemble(
        config: Config,
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        api: Arc<dyn GraphApi>,
    ) -> Self {
        let policy = AccessPolicy::from_config(&config.access);
        let engine = TickEngine::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&api),
            TickSettings::from_config(&config),
        );
        let driver = Driver::new(&config, Arc::clone(&store), engine, policy.clone());
        let jobs = JobService::new(&config, store, blobs, api, policy);
        Self { config, jobs, driver }
    }

    /// Snapshot-backed store and graph files under `storage.data_dir`,
    /// talking to the real upstream API.
    pub async fn open_local(config: Config) -> Result<Self> {
        let store = MemoryStore::open(config.storage.store_path()).await?;
        let blobs = LocalBlobStore::new(&config.storage.data_dir);
        let api = HttpGraphApi::new(&config.crawler, &config.api)?;
        log::debug!("Opened local store at {}", config.storage.store_path().display());
        Ok(Self::assemble(config, Arc::new(store), Arc::new(blobs), Arc::new(api)))
    }
}
