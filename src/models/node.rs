//! Graph node data structure.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Unavailable;

/// Stored descriptions are cut to this many characters.
pub const DESCRIPTION_LIMIT: usize = 500;

/// How a node relates to the root of its crawl.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Relationship {
    #[default]
    Root,
    Friend,
    Follower,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::Root => "Root",
            Relationship::Friend => "Friend",
            Relationship::Follower => "Follower",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account profile as returned by the upstream lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Profile {
    pub id: String,
    pub screen_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub profile_image_url: String,
    #[serde(default)]
    pub friends_count: u64,
    #[serde(default)]
    pub followers_count: u64,
}

impl Profile {
    /// Synthetic profile for an account that is suspended or gone.
    pub fn placeholder(id: impl Into<String>, reason: Unavailable) -> Self {
        Self {
            id: id.into(),
            screen_name: reason.placeholder_name().to_string(),
            ..Self::default()
        }
    }
}

/// One account in the crawled graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GraphNode {
    /// Upstream account id
    pub id: String,

    /// Display name (screen name)
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub profile_url: String,

    /// At most [`DESCRIPTION_LIMIT`] characters
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub avatar_url: String,

    pub relationship: Relationship,

    #[serde(default)]
    pub friend_count: u64,

    #[serde(default)]
    pub follower_count: u64,

    /// Ids this account follows, only kept for small fan-outs and the root
    #[serde(default)]
    pub friend_ids: Vec<String>,

    /// Ids following this account, only kept for small fan-outs and the root
    #[serde(default)]
    pub follower_ids: Vec<String>,

    /// Profile data has been fetched at least once
    #[serde(default)]
    pub hydrated: bool,
}

impl GraphNode {
    /// Bare node awaiting hydration.
    pub fn pending(id: impl Into<String>, relationship: Relationship) -> Self {
        Self {
            id: id.into(),
            relationship,
            ..Self::default()
        }
    }

    /// Root node built from a freshly looked-up profile.
    pub fn root(profile: &Profile) -> Self {
        let mut node = Self::pending(profile.id.clone(), Relationship::Root);
        node.apply_profile(profile);
        node
    }

    /// Copy profile fields onto the node. Id lists and the hydrated flag
    /// are left alone.
    pub fn apply_profile(&mut self, profile: &Profile) {
        self.display_name = profile.screen_name.clone();
        self.profile_url = profile.url.clone();
        self.description = truncate_description(&profile.description);
        self.avatar_url = profile.profile_image_url.clone();
        self.friend_count = profile.friends_count;
        self.follower_count = profile.followers_count;
    }

    /// Copy profile fields and mark the node hydrated.
    pub fn hydrate(&mut self, profile: &Profile) {
        self.apply_profile(profile);
        self.hydrated = true;
    }
}

/// Cut a description to [`DESCRIPTION_LIMIT`] characters.
pub fn truncate_description(text: &str) -> String {
    match text.char_indices().nth(DESCRIPTION_LIMIT) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}
