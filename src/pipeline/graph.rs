// src/pipeline/graph.rs

//! GML export of a finished crawl.
//!
//! The exported graph is capped to the root's immediate neighbourhood:
//! ids attached to children by inline expansion only contribute edges
//! between nodes that are already in that neighbourhood.
//!
//! Upstream ids are opaque strings, so nodes get sequential integer GML
//! ids in emit order (the root is 0) and keep the upstream id in
//! `user_id`. Edges refer to the integer ids.
//!
//! ```text
//! graph [
//!   directed 1
//!   node [ id 0 user_id "1" label "root" type "Root" ... ]
//!   edge [ source 0 target 1 ]
//! ]
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write;

use crate::models::GraphNode;

/// Escape a value for a double-quoted GML string.
fn escape(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

fn write_node(out: &mut String, gml_id: usize, node: &GraphNode) {
    let _ = write!(
        out,
        "\n  node [\n    id {gml_id}\n    user_id \"{user_id}\"\n    label \"{label}\"\n    type \"{kind}\"\n    \
         profile_url \"{url}\"\n    description \"{description}\"\n    profile_image_url \"{avatar}\"\n    \
         friends {friends}\n    followers {followers}\n  ]",
        user_id = escape(&node.id),
        label = escape(&node.display_name),
        kind = node.relationship,
        url = escape(&node.profile_url),
        description = escape(&node.description),
        avatar = escape(&node.avatar_url),
        friends = node.friend_count,
        followers = node.follower_count,
    );
}

/// Directed edges contributed by one node, limited to emitted endpoints.
fn collect_edges(edges: &mut BTreeSet<(usize, usize)>, index: &HashMap<&str, usize>, node: &GraphNode) {
    let Some(&own) = index.get(node.id.as_str()) else {
        return;
    };
    for follower in &node.follower_ids {
        if let Some(&source) = index.get(follower.as_str()) {
            edges.insert((source, own));
        }
    }
    for friend in &node.friend_ids {
        if let Some(&target) = index.get(friend.as_str()) {
            edges.insert((own, target));
        }
    }
}

/// Serialize the root and its children as a directed GML graph.
///
/// Nodes whose id is outside the root's neighbourhood are left out, and an
/// edge discovered more than once is written once. Edges are emitted in
/// `(source, target)` order so the output is deterministic.
pub fn export_graph(root: &GraphNode, children: &[GraphNode]) -> Vec<u8> {
    let valid: HashSet<&str> = std::iter::once(root.id.as_str())
        .chain(root.friend_ids.iter().map(String::as_str))
        .chain(root.follower_ids.iter().map(String::as_str))
        .collect();

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut nodes: Vec<&GraphNode> = Vec::new();
    for node in std::iter::once(root).chain(children) {
        if valid.contains(node.id.as_str()) && !index.contains_key(node.id.as_str()) {
            index.insert(node.id.as_str(), nodes.len());
            nodes.push(node);
        }
    }

    let mut edges = BTreeSet::new();
    for node in nodes.iter().copied() {
        collect_edges(&mut edges, &index, node);
    }

    let mut out = String::from("graph [\n  directed 1");
    for (gml_id, node) in nodes.iter().enumerate() {
        write_node(&mut out, gml_id, node);
    }
    for (source, target) in &edges {
        let _ = write!(out, "\n  edge [\n    source {}\n    target {}\n  ]", source, target);
    }
    out.push_str("\n]\n");

    log::debug!("Exported graph: {} nodes, {} edges", nodes.len(), edges.len());
    out.into_bytes()
}
