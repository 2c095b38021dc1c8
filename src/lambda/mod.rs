// src/lambda/mod.rs

//! AWS Lambda handler for the scheduled trigger.
//!
//! Each invocation:
//! 1. Loads configuration from the bundled file plus environment overrides
//! 2. Opens the job store snapshot and the graph files in the S3 bucket
//! 3. Runs one driver invocation as the scheduler
//! 4. Returns the per-job report lines

use std::sync::Arc;

use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::app::App;
use crate::error::Result;
use crate::models::Config;
use crate::pipeline::{Caller, Invocation, Target};
use crate::services::HttpGraphApi;
use crate::storage::MemoryStore;
use crate::storage::s3::S3BlobStore;

/// Lambda invocation payload. Both fields empty means every owner.
#[derive(Debug, Default, Deserialize)]
pub struct TickRequest {
    #[serde(default)]
    pub owner_id: Option<String>,

    #[serde(default)]
    pub root_id: Option<String>,
}

/// Lambda response payload.
#[derive(Debug, Serialize)]
pub struct TickResponse {
    /// `success` or `error`
    pub status: &'static str,

    pub report: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

/// Main Lambda handler function.
#[instrument(skip(event))]
pub async fn handler(event: LambdaEvent<TickRequest>) -> std::result::Result<TickResponse, LambdaError> {
    let start = std::time::Instant::now();
    let (request, _context) = event.into_parts();

    info!("Tick requested: owner={:?}, root={:?}", request.owner_id, request.root_id);

    match run_tick(request).await {
        Ok(invocation) => {
            let failures = invocation.reports().iter().filter(|r| r.is_failure()).count();
            let report = invocation.lines();
            info!("Invocation finished: {} line(s), {} failure(s)", report.len(), failures);
            Ok(TickResponse {
                status: "success",
                report,
                error: None,
                execution_time_ms: start.elapsed().as_millis() as u64,
            })
        }
        Err(e) => {
            error!("Invocation failed: {}", e);
            Ok(TickResponse {
                status: "error",
                report: Vec::new(),
                error: Some(e.to_string()),
                execution_time_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

async fn run_tick(request: TickRequest) -> Result<Invocation> {
    let config = load_lambda_config()?;
    let target = Target::from_address(request.owner_id, request.root_id)?;

    let blobs = S3BlobStore::from_env().await?;
    let snapshot = blobs.snapshot(&snapshot_key(&config));
    let store = MemoryStore::with_backend(Arc::new(snapshot)).await?;
    let api = HttpGraphApi::new(&config.crawler, &config.api)?;
    let app = App::assemble(config, Arc::new(store), Arc::new(blobs), Arc::new(api));

    let cancel = CancellationToken::new();
    app.driver.run(&Caller::Scheduler, target, &cancel).await
}

/// Object key of the store snapshot. Concurrent invocations share it, so
/// it never lives on the function's local disk.
fn snapshot_key(config: &Config) -> String {
    std::env::var("S3_STATE_KEY").unwrap_or_else(|_| format!("state/{}", config.storage.store_file))
}

/// Load configuration suitable for Lambda environment.
fn load_lambda_config() -> Result<Config> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = Config::load_or_default(&path);
    config.apply_env();
    config.validate()?;
    Ok(config)
}
