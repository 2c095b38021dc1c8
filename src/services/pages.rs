//! Single-page id fetches.
//!
//! Each helper makes exactly one upstream call. Looping across pages is
//! the tick engine's job, one page per tick.

use crate::error::Result;
use crate::models::{Cursor, GraphNode};
use crate::services::api::GraphApi;

/// Ids returned by one page plus the cursor to store for the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub ids: Vec<String>,
    pub next: Cursor,
}

/// Fetch one page of the accounts `node` follows and append them to
/// `node.friend_ids`.
pub async fn fetch_friends_page(
    api: &dyn GraphApi,
    node: &mut GraphNode,
    cursor: Cursor,
    page_size: u32,
) -> Result<FetchedPage> {
    let page = api.friend_ids(&node.id, cursor.as_request(), page_size).await?;
    node.friend_ids.extend(page.ids.iter().cloned());
    Ok(FetchedPage {
        ids: page.ids,
        next: Cursor::after_page(page.next_cursor),
    })
}

/// Fetch one page of `node`'s followers and append them to
/// `node.follower_ids`.
pub async fn fetch_followers_page(
    api: &dyn GraphApi,
    node: &mut GraphNode,
    cursor: Cursor,
    page_size: u32,
) -> Result<FetchedPage> {
    let page = api.follower_ids(&node.id, cursor.as_request(), page_size).await?;
    node.follower_ids.extend(page.ids.iter().cloned());
    Ok(FetchedPage {
        ids: page.ids,
        next: Cursor::after_page(page.next_cursor),
    })
}
