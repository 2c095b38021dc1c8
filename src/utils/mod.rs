//! Utility functions and helpers.

pub mod http;

use std::future::Future;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Run `fut` until it finishes, `limit` elapses or `cancel` fires,
/// whichever comes first.
///
/// A timeout surfaces as [`AppError::Timeout`] and a cancellation as
/// [`AppError::Cancelled`]; in both cases `fut` is dropped mid-flight.
pub async fn bounded<T, F>(limit: Duration, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        outcome = tokio::time::timeout(limit, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(limit)),
        },
    }
}

static LEASE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Mint an opaque, process-unique lease token.
pub fn mint_lease_token() -> String {
    let n = LEASE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(process::id().to_le_bytes());
    hasher.update(now.to_le_bytes());
    hasher.update(n.to_le_bytes());
    hex::encode(&hasher.finalize()[..12])
}

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
