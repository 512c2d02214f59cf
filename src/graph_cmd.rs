//! `loom graph`: rebuild the reply graph from stored messages.
//!
//! With `--save`, the graph is written as four JSON files under the output
//! directory (`nodes.json`, `adjacency.json`, `thread_roots.json`,
//! `metadata.json`), each replaced atomically.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use threadloom_core::graph::{GraphStats, ReplyGraph, ReplyGraphNode};
use threadloom_core::store::Store;

use crate::cache::write_atomic;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub built_at: DateTime<Utc>,
    pub stats: GraphStats,
    pub integrity_issues: usize,
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(&dir.join(name), &bytes)
}

fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Invalid JSON in {}", path.display()))
}

pub fn save_snapshot(graph: &ReplyGraph, dir: &Path, built_at: DateTime<Utc>) -> Result<()> {
    write_json(dir, "nodes.json", graph.nodes())?;
    write_json(dir, "adjacency.json", graph.adjacency())?;
    write_json(dir, "thread_roots.json", graph.roots())?;
    // Metadata last: its presence marks a complete snapshot.
    write_json(
        dir,
        "metadata.json",
        &GraphMetadata {
            built_at,
            stats: graph.stats(),
            integrity_issues: graph.integrity_issues().len(),
        },
    )
}

pub fn load_snapshot(dir: &Path) -> Result<(ReplyGraph, GraphMetadata)> {
    let metadata: GraphMetadata = read_json(dir, "metadata.json")?;
    let nodes: BTreeMap<String, ReplyGraphNode> = read_json(dir, "nodes.json")?;
    let adjacency: BTreeMap<String, Vec<String>> = read_json(dir, "adjacency.json")?;
    let roots: Vec<String> = read_json(dir, "thread_roots.json")?;
    Ok((ReplyGraph::from_parts(nodes, adjacency, roots), metadata))
}

pub async fn run_graph(config: &Config, save: Option<&Path>) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let messages = store.all_messages().await?;
    pool.close().await;

    let graph = ReplyGraph::build(&messages);
    let stats = graph.stats();
    info!(
        messages = stats.total_messages,
        threads = stats.thread_count,
        "reply graph built"
    );
    for issue in graph.integrity_issues() {
        warn!(
            message_id = %issue.message_id,
            parent_id = %issue.parent_id,
            reason = issue.reason,
            "broken reply link"
        );
    }

    if let Some(dir) = save {
        save_snapshot(&graph, dir, Utc::now())?;
        info!(dir = %dir.display(), "graph snapshot written");
    }

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use threadloom_core::models::{CanonicalMessage, SourceType};

    fn msg(id: &str, parent: Option<&str>, secs: i64) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            source_type: SourceType::Slack,
            source_id: id.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            author_id: "user_slack_T1_U1".into(),
            content: "text".into(),
            channel_id: "chan_slack_T1_C1".into(),
            thread_id: "root".into(),
            parent_id: parent.map(String::from),
            is_thread_root: parent.is_none(),
            mentions: Default::default(),
            urls: vec![],
            code_blocks: vec![],
            source_metadata: Default::default(),
        }
    }

    #[test]
    fn test_snapshot_reloads_same_graph() {
        let messages = vec![
            msg("root", None, 1),
            msg("a", Some("root"), 2),
            msg("b", Some("a"), 3),
        ];
        let graph = ReplyGraph::build(&messages);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("graph");

        save_snapshot(&graph, &out, Utc.timestamp_opt(100, 0).unwrap()).unwrap();
        let (loaded, metadata) = load_snapshot(&out).unwrap();

        assert_eq!(loaded, graph);
        assert_eq!(metadata.stats.max_thread_depth, 2);
        assert_eq!(metadata.integrity_issues, 0);
        assert!(!out.join("nodes.json.tmp").exists());
    }
}
