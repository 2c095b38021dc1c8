//! Upstream social-graph API boundary.

use async_trait::async_trait;

use crate::error::{AppError, Result};
pub use crate::models::Profile;

/// One page of account ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdPage {
    pub ids: Vec<String>,

    /// Upstream continuation; `0` once exhausted
    pub next_cursor: i64,
}

/// Paginated id lists plus user lookup, under a hard per-window quota.
///
/// Suspended or deleted accounts fail with
/// [`AppError::AccountUnavailable`]; everything else is transient or a
/// transport error.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn lookup_by_handle(&self, handle: &str) -> Result<Profile>;

    async fn lookup_by_id(&self, id: &str) -> Result<Profile>;

    async fn friend_ids(&self, id: &str, cursor: i64, page_size: u32) -> Result<IdPage>;

    async fn follower_ids(&self, id: &str, cursor: i64, page_size: u32) -> Result<IdPage>;
}

/// Look up `id`, substituting a placeholder profile for accounts that are
/// suspended or gone so hydration keeps moving.
pub async fn lookup_or_placeholder(api: &dyn GraphApi, id: &str) -> Result<Profile> {
    match api.lookup_by_id(id).await {
        Ok(profile) => Ok(profile),
        Err(AppError::AccountUnavailable { reason, .. }) => {
            log::info!("Account {} is {}, using placeholder", id, reason);
            Ok(Profile::placeholder(id, reason))
        }
        Err(e) => Err(e),
    }
}
