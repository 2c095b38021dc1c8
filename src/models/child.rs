//! Child task: one discovered friend or follower awaiting hydration.

use serde::{Deserialize, Serialize};

use crate::models::job::JobKey;
use crate::models::node::{GraphNode, Relationship};

/// Identity of a child task under its job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChildKey {
    pub owner_id: String,
    pub root_id: String,
    pub child_id: String,
}

impl ChildKey {
    pub fn job(&self) -> JobKey {
        JobKey::new(self.owner_id.clone(), self.root_id.clone())
    }

    /// Whether this child belongs to the given job.
    pub fn is_under(&self, job: &JobKey) -> bool {
        self.owner_id == job.owner_id && self.root_id == job.root_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTask {
    pub owner_id: String,

    /// Root id of the owning job
    pub parent_id: String,

    pub node: GraphNode,
}

impl ChildTask {
    /// Unhydrated task for an id discovered while paging `job`.
    pub fn discovered(job: &JobKey, child_id: impl Into<String>, relationship: Relationship) -> Self {
        Self {
            owner_id: job.owner_id.clone(),
            parent_id: job.root_id.clone(),
            node: GraphNode::pending(child_id, relationship),
        }
    }

    pub fn key(&self) -> ChildKey {
        ChildKey {
            owner_id: self.owner_id.clone(),
            root_id: self.parent_id.clone(),
            child_id: self.node.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovered_child_is_unhydrated() {
        let job = JobKey::new("owner", "1");
        let child = ChildTask::discovered(&job, "2", Relationship::Friend);
        assert!(!child.node.hydrated);
        assert_eq!(child.parent_id, "1");
        assert_eq!(child.node.relationship, Relationship::Friend);
        assert!(child.key().is_under(&job));
        assert_eq!(child.key().job(), job);
    }
}
