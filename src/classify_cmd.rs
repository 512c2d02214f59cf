//! `loom classify`: label and enrich every stored message and upsert the
//! results.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use threadloom_core::classify::{classify_all, enrich_message};
use threadloom_core::models::ClassificationType;
use threadloom_core::store::Store;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Classify and enrich all messages in `store`; returns how many labels of
/// each type were written.
pub async fn classify_store(store: &dyn Store) -> Result<BTreeMap<ClassificationType, usize>> {
    let messages = store.all_messages().await?;
    let classifications = classify_all(&messages);

    let mut counts: BTreeMap<ClassificationType, usize> =
        ClassificationType::ALL.into_iter().map(|t| (t, 0)).collect();
    for c in &classifications {
        store.save_classification(c).await?;
        *counts.entry(c.kind).or_default() += 1;
    }
    for m in &messages {
        store.save_enrichment(&enrich_message(m)).await?;
    }
    info!(
        messages = messages.len(),
        labels = classifications.len(),
        "classification complete"
    );
    Ok(counts)
}

pub async fn run_classify(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let counts = classify_store(&store).await?;
    pool.close().await;

    let json: BTreeMap<&str, usize> = counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use threadloom_core::models::{CanonicalMessage, SourceType};
    use threadloom_core::store::memory::InMemoryStore;

    fn msg(id: &str, parent: Option<&str>, author: &str, content: &str, secs: i64) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            source_type: SourceType::Slack,
            source_id: id.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            author_id: author.into(),
            content: content.into(),
            channel_id: "chan_slack_T1_C1".into(),
            thread_id: "q".into(),
            parent_id: parent.map(String::from),
            is_thread_root: parent.is_none(),
            mentions: Default::default(),
            urls: vec![],
            code_blocks: vec![],
            source_metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_classify_store_upserts_and_is_idempotent() {
        let store = InMemoryStore::new();
        store
            .save_message(&msg("q", None, "alice", "How do I restart the deploy worker?", 1))
            .await
            .unwrap();
        store
            .save_message(&msg("t", Some("q"), "alice", "thanks, that worked!", 3))
            .await
            .unwrap();

        let first = classify_store(&store).await.unwrap();
        assert!(first[&ClassificationType::Question] >= 1);
        let second = classify_store(&store).await.unwrap();
        assert_eq!(first, second);

        let stored = store.classifications_for("q").await.unwrap();
        assert!(stored.iter().any(|c| c.kind == ClassificationType::Question));
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.classifications as usize, second.values().sum::<usize>());
        assert_eq!(counts.enrichments, 2);
        let enrichment = store.enrichment_for("q").await.unwrap().unwrap();
        assert!(enrichment.is_question);
        assert_eq!(enrichment.word_count, 7);
    }
}
