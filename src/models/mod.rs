// src/models/mod.rs

//! Domain models for the crawler.
//!
//! Jobs own a root [`GraphNode`] and pagination state; child tasks hold the
//! friends and followers discovered while paging.

mod child;
mod config;
mod job;
mod node;

// Re-export all public types
pub use child::{ChildKey, ChildTask};
pub use config::{
    AccessConfig, ApiConfig, Config, CrawlerConfig, LeaseConfig, LoggingConfig, MAX_BATCH_WRITES,
    StorageConfig, ThrottleConfig,
};
pub use job::{Cursor, Job, JobKey, Lease, Phase, TickBudget};
pub use node::{DESCRIPTION_LIMIT, GraphNode, Profile, Relationship, truncate_description};
