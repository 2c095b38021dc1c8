//! Crawl job record and its phase machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::node::{GraphNode, Profile};

/// Composite identity of a job: owning user plus root account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub owner_id: String,
    pub root_id: String,
}

impl JobKey {
    pub fn new(owner_id: impl Into<String>, root_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            root_id: root_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.root_id)
    }
}

/// Upstream pagination cursor.
///
/// Stored as an integer: `-1` before the first page, `0` once exhausted,
/// anything else is an opaque token replayed verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Cursor {
    Start,
    Token(i64),
    Exhausted,
}

impl Cursor {
    /// Value to send upstream for the next page request.
    pub fn as_request(&self) -> i64 {
        i64::from(*self)
    }

    /// Cursor following a page whose upstream "next" value was `next`.
    ///
    /// Never returns [`Cursor::Start`], so pagination cannot restart.
    pub fn after_page(next: i64) -> Self {
        match next {
            0 | -1 => Cursor::Exhausted,
            token => Cursor::Token(token),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Cursor::Exhausted)
    }
}

impl From<i64> for Cursor {
    fn from(raw: i64) -> Self {
        match raw {
            -1 => Cursor::Start,
            0 => Cursor::Exhausted,
            token => Cursor::Token(token),
        }
    }
}

impl From<Cursor> for i64 {
    fn from(cursor: Cursor) -> Self {
        match cursor {
            Cursor::Start => -1,
            Cursor::Exhausted => 0,
            Cursor::Token(token) => token,
        }
    }
}

/// The single active phase of a job, derived from its stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing fetched yet; the first follower page is next
    NotStarted,
    PagingFollowers(Cursor),
    PagingFriends(Cursor),
    /// Both id lists complete, child count not computed
    Counting,
    Hydrating { remaining: u64 },
    PreparingOutput,
    Done,
}

impl Phase {
    /// Position in the fixed phase order. Phases only move forward.
    pub fn rank(&self) -> u8 {
        match self {
            Phase::NotStarted => 0,
            Phase::PagingFollowers(_) => 1,
            Phase::PagingFriends(_) => 2,
            Phase::Counting => 3,
            Phase::Hydrating { .. } => 4,
            Phase::PreparingOutput => 5,
            Phase::Done => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Phase::NotStarted => "not-started",
            Phase::PagingFollowers(_) => "paging-followers",
            Phase::PagingFriends(_) => "paging-friends",
            Phase::Counting => "counting",
            Phase::Hydrating { .. } => "hydrating",
            Phase::PreparingOutput => "preparing-output",
            Phase::Done => "done",
        }
    }
}

/// Short-lived ownership of a job by one driver invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether someone other than `token` holds this lease at `now`.
    pub fn blocks(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.token != token && self.expires_at > now
    }
}

/// Persisted token-bucket state for upstream calls made on behalf of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickBudget {
    pub tokens: f64,
    pub refilled_at: DateTime<Utc>,
}

/// One root-account crawl owned by one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub owner_id: String,

    /// Root account; its id is the job's `root_id`
    pub node: GraphNode,

    pub followers_cursor: Cursor,

    pub friends_cursor: Cursor,

    /// Unhydrated children left; `None` (stored as -1) until counted
    #[serde(with = "remaining_sentinel")]
    pub remaining: Option<u64>,

    /// Latest progress or error message
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub preparing_output: bool,

    #[serde(default)]
    pub done: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub lease: Option<Lease>,

    #[serde(default)]
    pub budget: Option<TickBudget>,

    /// SHA-256 of the exported graph file
    #[serde(default)]
    pub graph_digest: Option<String>,
}

impl Job {
    /// Fresh job for a looked-up root profile.
    ///
    /// A list the profile reports as empty starts out exhausted, so no
    /// tick is spent paging it.
    pub fn new(owner_id: impl Into<String>, root: &Profile, now: DateTime<Utc>) -> Self {
        let initial = |count: u64| if count == 0 { Cursor::Exhausted } else { Cursor::Start };
        Self {
            owner_id: owner_id.into(),
            node: GraphNode::root(root),
            followers_cursor: initial(root.followers_count),
            friends_cursor: initial(root.friends_count),
            remaining: None,
            status: "Enqueued".to_string(),
            preparing_output: false,
            done: false,
            created_at: now,
            lease: None,
            budget: None,
            graph_digest: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.owner_id.clone(), self.node.id.clone())
    }

    pub fn root_id(&self) -> &str {
        &self.node.id
    }

    /// Derive the active phase. The order of checks is the tick priority.
    pub fn phase(&self) -> Phase {
        if self.done {
            return Phase::Done;
        }
        if self.preparing_output {
            return Phase::PreparingOutput;
        }
        match (self.followers_cursor, self.friends_cursor) {
            (Cursor::Start, Cursor::Start) => Phase::NotStarted,
            (followers, _) if !followers.is_exhausted() => Phase::PagingFollowers(followers),
            (_, friends) if !friends.is_exhausted() => Phase::PagingFriends(friends),
            _ => match self.remaining {
                None => Phase::Counting,
                Some(remaining) => Phase::Hydrating { remaining },
            },
        }
    }

    /// Count of distinct ids across the root's friend and follower lists.
    pub fn distinct_child_count(&self) -> u64 {
        let unique: std::collections::HashSet<&str> = self
            .node
            .friend_ids
            .iter()
            .chain(self.node.follower_ids.iter())
            .map(String::as_str)
            .collect();
        unique.len() as u64
    }

    /// Record one hydrated child.
    pub fn child_hydrated(&mut self) {
        self.remaining = Some(self.remaining.unwrap_or(0).saturating_sub(1));
    }

    /// Switch to the output phase once no child is left to hydrate.
    pub fn begin_output(&mut self) {
        self.remaining = Some(0);
        self.preparing_output = true;
    }

    /// Terminal transition after the graph file was written.
    pub fn finish(&mut self, digest: String) {
        self.status.clear();
        self.preparing_output = false;
        self.done = true;
        self.graph_digest = Some(digest);
    }
}

/// Serializes `Option<u64>` as the integer `-1` when absent.
mod remaining_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => serializer.serialize_i64(*n as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(u64::try_from(raw).ok())
    }
}
