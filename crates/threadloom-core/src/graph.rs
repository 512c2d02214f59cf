//! Parent/child reply graph over a set of canonical messages.
//!
//! The graph is an index: it is rebuilt from the stored messages on demand
//! and never mutated in place. Nodes hold a denormalized copy of the fields
//! traversal and classification need, so the graph can be snapshotted and
//! reloaded without the message store.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{CanonicalMessage, SourceType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyGraphNode {
    pub message_id: String,
    pub parent_id: Option<String>,
    pub thread_id: String,
    pub author_id: String,
    pub channel_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_type: SourceType,
    pub is_thread_root: bool,
}

impl From<&CanonicalMessage> for ReplyGraphNode {
    fn from(m: &CanonicalMessage) -> Self {
        Self {
            message_id: m.id.clone(),
            parent_id: m.parent_id.clone(),
            thread_id: m.thread_id.clone(),
            author_id: m.author_id.clone(),
            channel_id: m.channel_id.clone(),
            timestamp: m.timestamp,
            source_type: m.source_type,
            is_thread_root: m.is_thread_root,
        }
    }
}

/// Aggregate statistics over a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_messages: usize,
    pub thread_count: usize,
    pub reply_messages: usize,
    pub messages_with_replies: usize,
    pub average_thread_depth: f64,
    pub max_thread_depth: usize,
}

/// A broken parent link found by [`ReplyGraph::integrity_issues`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    pub message_id: String,
    pub parent_id: String,
    pub reason: &'static str,
}

/// Index of messages by id with parent-to-children adjacency and the
/// ordered list of thread roots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyGraph {
    nodes: BTreeMap<String, ReplyGraphNode>,
    adjacency: BTreeMap<String, Vec<String>>,
    roots: Vec<String>,
}

impl ReplyGraph {
    /// Build a graph in one pass over `messages`.
    ///
    /// Children are recorded in input order. A parent that is absent from
    /// the set still gets an adjacency entry; traversal simply never reaches
    /// it. Duplicate ids keep their first occurrence.
    pub fn build<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a CanonicalMessage>,
    {
        let mut graph = ReplyGraph::default();
        for m in messages {
            if graph.nodes.contains_key(&m.id) {
                debug!(message_id = %m.id, "duplicate message id ignored");
                continue;
            }
            graph.nodes.insert(m.id.clone(), ReplyGraphNode::from(m));
            if m.is_thread_root {
                graph.roots.push(m.id.clone());
            }
            if let Some(parent) = &m.parent_id {
                graph
                    .adjacency
                    .entry(parent.clone())
                    .or_default()
                    .push(m.id.clone());
            }
        }
        graph
    }

    /// Reassemble a graph from its persisted parts.
    pub fn from_parts(
        nodes: BTreeMap<String, ReplyGraphNode>,
        adjacency: BTreeMap<String, Vec<String>>,
        roots: Vec<String>,
    ) -> Self {
        Self {
            nodes,
            adjacency,
            roots,
        }
    }

    pub fn nodes(&self) -> &BTreeMap<String, ReplyGraphNode> {
        &self.nodes
    }

    pub fn adjacency(&self) -> &BTreeMap<String, Vec<String>> {
        &self.adjacency
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn node(&self, id: &str) -> Option<&ReplyGraphNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pre-order traversal of the thread under `root_id`.
    ///
    /// The root comes first, then each child subtree in insertion order.
    /// Unknown roots yield an empty list; each node is visited once even if
    /// the data contains a cycle.
    pub fn thread(&self, root_id: &str) -> Vec<&ReplyGraphNode> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![root_id];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            out.push(node);
            for child in self.children(id).iter().rev() {
                if !visited.contains(child.as_str()) {
                    stack.push(child.as_str());
                }
            }
        }
        out
    }

    /// Length of the longest parent-to-child chain below `root_id`.
    ///
    /// A node with no children has depth 0.
    pub fn depth(&self, root_id: &str) -> usize {
        let mut max = 0;
        let mut visited = HashSet::new();
        let mut stack = vec![(root_id, 0usize)];
        while let Some((id, d)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            max = max.max(d);
            for child in self.children(id) {
                if !visited.contains(child.as_str()) {
                    stack.push((child.as_str(), d + 1));
                }
            }
        }
        max
    }

    pub fn stats(&self) -> GraphStats {
        let total = self.nodes.len();
        let thread_count = self.roots.len();
        let depths: Vec<usize> = self.roots.iter().map(|r| self.depth(r)).collect();
        let average = if depths.is_empty() {
            0.0
        } else {
            depths.iter().sum::<usize>() as f64 / depths.len() as f64
        };
        GraphStats {
            total_messages: total,
            thread_count,
            reply_messages: total.saturating_sub(thread_count),
            messages_with_replies: self.adjacency.values().filter(|c| !c.is_empty()).count(),
            average_thread_depth: average,
            max_thread_depth: depths.into_iter().max().unwrap_or(0),
        }
    }

    /// Replies whose parent is missing or lives in another thread.
    pub fn integrity_issues(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();
        for node in self.nodes.values() {
            let Some(parent_id) = &node.parent_id else {
                continue;
            };
            match self.nodes.get(parent_id) {
                None => issues.push(IntegrityIssue {
                    message_id: node.message_id.clone(),
                    parent_id: parent_id.clone(),
                    reason: "parent not in message set",
                }),
                Some(parent) if parent.thread_id != node.thread_id => {
                    issues.push(IntegrityIssue {
                        message_id: node.message_id.clone(),
                        parent_id: parent_id.clone(),
                        reason: "parent belongs to a different thread",
                    })
                }
                Some(_) => {}
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, parent: Option<&str>, thread: &str, secs: i64) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            source_type: SourceType::Slack,
            source_id: id.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            author_id: "u".into(),
            content: String::new(),
            channel_id: "c".into(),
            thread_id: thread.into(),
            parent_id: parent.map(String::from),
            is_thread_root: parent.is_none(),
            mentions: Default::default(),
            urls: vec![],
            code_blocks: vec![],
            source_metadata: Default::default(),
        }
    }

    fn sample() -> Vec<CanonicalMessage> {
        vec![
            msg("r1", None, "r1", 1),
            msg("a", Some("r1"), "r1", 2),
            msg("b", Some("r1"), "r1", 3),
            msg("a1", Some("a"), "r1", 4),
            msg("r2", None, "r2", 5),
        ]
    }

    #[test]
    fn test_thread_is_pre_order() {
        let messages = sample();
        let g = ReplyGraph::build(&messages);
        let ids: Vec<_> = g.thread("r1").iter().map(|n| n.message_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "a", "a1", "b"]);
        assert_eq!(g.thread("r2").len(), 1);
        assert!(g.thread("missing").is_empty());
    }

    #[test]
    fn test_depth() {
        let messages = sample();
        let g = ReplyGraph::build(&messages);
        assert_eq!(g.depth("r1"), 2);
        assert_eq!(g.depth("r2"), 0);
        assert_eq!(g.depth("a1"), 0);
    }

    #[test]
    fn test_stats() {
        let messages = sample();
        let stats = ReplyGraph::build(&messages).stats();
        assert_eq!(stats.total_messages, 5);
        assert_eq!(stats.thread_count, 2);
        assert_eq!(stats.reply_messages, 3);
        assert_eq!(stats.messages_with_replies, 2);
        assert!((stats.average_thread_depth - 1.0).abs() < f64::EPSILON);
        assert_eq!(stats.max_thread_depth, 2);
    }

    #[test]
    fn test_every_reply_reachable_from_its_root() {
        let messages = sample();
        let g = ReplyGraph::build(&messages);
        let reached: usize = g.roots().iter().map(|r| g.thread(r).len()).sum();
        assert_eq!(reached, g.len());
        assert!(g.integrity_issues().is_empty());
    }

    #[test]
    fn test_missing_parent_reported_not_traversed() {
        let messages = vec![msg("r", None, "r", 1), msg("x", Some("gone"), "r", 2)];
        let g = ReplyGraph::build(&messages);
        assert_eq!(g.thread("r").len(), 1);
        let issues = g.integrity_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].message_id, "x");
    }

    #[test]
    fn test_cycle_is_guarded() {
        let mut a = msg("a", Some("b"), "t", 1);
        a.is_thread_root = true;
        let b = msg("b", Some("a"), "t", 2);
        let messages = vec![a, b];
        let g = ReplyGraph::build(&messages);
        assert_eq!(g.thread("a").len(), 2);
        assert_eq!(g.depth("a"), 1);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let messages = vec![msg("r", None, "r", 1), msg("r", None, "r", 9)];
        let g = ReplyGraph::build(&messages);
        assert_eq!(g.roots().len(), 1);
        assert_eq!(g.node("r").unwrap().timestamp.timestamp(), 1);
    }

    #[test]
    fn test_empty_graph_stats() {
        let stats = ReplyGraph::default().stats();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.average_thread_depth, 0.0);
    }
}
