//! Service layer for the crawler application.
//!
//! This module contains:
//! - The upstream API boundary (`GraphApi`) and its HTTP client
//! - Single-page id fetches used by the tick engine
//! - Owner-facing job management (`JobService`)

pub mod api;
pub mod http;
pub mod jobs;
pub mod pages;

pub use api::{GraphApi, IdPage, lookup_or_placeholder};
pub use http::HttpGraphApi;
pub use jobs::{GraphDownload, JobService, JobStatus};
pub use pages::{FetchedPage, fetch_followers_page, fetch_friends_page};
