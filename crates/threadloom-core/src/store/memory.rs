//! In-memory [`Store`] and [`RateLimitStore`] for tests and dry runs.
//!
//! Uses `HashMap` behind `std::sync::RwLock`. Queries are linear scans.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    CanonicalMessage, Channel, Classification, ClassificationType, Enrichment, RawPayload, User,
};
use crate::ratelimit::{RateLimitKey, RateLimitState, RateLimitStore};

use super::{MessageQuery, Store, StoreCounts};

/// In-memory store for testing.
pub struct InMemoryStore {
    messages: RwLock<HashMap<String, CanonicalMessage>>,
    users: RwLock<HashMap<String, User>>,
    channels: RwLock<HashMap<String, Channel>>,
    raw: RwLock<HashMap<String, RawPayload>>,
    classifications: RwLock<HashMap<(String, ClassificationType), Classification>>,
    enrichments: RwLock<HashMap<String, Enrichment>>,
    rate_limits: RwLock<HashMap<RateLimitKey, RateLimitState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            raw: RwLock::new(HashMap::new()),
            classifications: RwLock::new(HashMap::new()),
            enrichments: RwLock::new(HashMap::new()),
            rate_limits: RwLock::new(HashMap::new()),
        }
    }

    pub fn raw_payload(&self, id: &str) -> Option<RawPayload> {
        read(&self.raw).ok()?.get(id).cloned()
    }

    pub fn user(&self, id: &str) -> Option<User> {
        read(&self.users).ok()?.get(id).cloned()
    }

    pub fn channel(&self, id: &str) -> Option<Channel> {
        read(&self.channels).ok()?.get(id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save_message(&self, msg: &CanonicalMessage) -> Result<()> {
        let mut messages = write(&self.messages)?;
        match messages.get_mut(&msg.id) {
            Some(existing) => {
                existing.content = msg.content.clone();
                existing.mentions = msg.mentions.clone();
                existing.urls = msg.urls.clone();
                existing.code_blocks = msg.code_blocks.clone();
                existing.source_metadata = msg.source_metadata.clone();
            }
            None => {
                messages.insert(msg.id.clone(), msg.clone());
            }
        }
        Ok(())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        write(&self.users)?.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        write(&self.channels)?.insert(channel.id.clone(), channel.clone());
        Ok(())
    }

    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()> {
        write(&self.raw)?.insert(raw.id.clone(), raw.clone());
        Ok(())
    }

    async fn save_classification(&self, classification: &Classification) -> Result<()> {
        write(&self.classifications)?.insert(
            (classification.message_id.clone(), classification.kind),
            classification.clone(),
        );
        Ok(())
    }

    async fn save_enrichment(&self, enrichment: &Enrichment) -> Result<()> {
        write(&self.enrichments)?.insert(enrichment.message_id.clone(), enrichment.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<CanonicalMessage>> {
        Ok(read(&self.messages)?.get(id).cloned())
    }

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<CanonicalMessage>> {
        let messages = read(&self.messages)?;
        let enrichments = read(&self.enrichments)?;
        let mut out: Vec<CanonicalMessage> = messages
            .values()
            .filter(|m| query.matches(m) && query.matches_enrichment(enrichments.get(&m.id)))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let out = out
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(out)
    }

    async fn classifications_for(&self, message_id: &str) -> Result<Vec<Classification>> {
        let mut out: Vec<Classification> = read(&self.classifications)?
            .values()
            .filter(|c| c.message_id == message_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.kind);
        Ok(out)
    }

    async fn enrichment_for(&self, message_id: &str) -> Result<Option<Enrichment>> {
        Ok(read(&self.enrichments)?.get(message_id).cloned())
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let messages = read(&self.messages)?;
        Ok(StoreCounts {
            messages: messages.len() as i64,
            thread_roots: messages.values().filter(|m| m.is_thread_root).count() as i64,
            users: read(&self.users)?.len() as i64,
            channels: read(&self.channels)?.len() as i64,
            raw_payloads: read(&self.raw)?.len() as i64,
            classifications: read(&self.classifications)?.len() as i64,
            enrichments: read(&self.enrichments)?.len() as i64,
        })
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn init_rate_limit(&self, key: &RateLimitKey, state: &RateLimitState) -> Result<()> {
        write(&self.rate_limits)?
            .entry(key.clone())
            .or_insert_with(|| state.clone());
        Ok(())
    }

    async fn get_rate_limit(&self, key: &RateLimitKey) -> Result<Option<RateLimitState>> {
        Ok(read(&self.rate_limits)?.get(key).cloned())
    }

    async fn record_request(&self, key: &RateLimitKey) -> Result<()> {
        let mut limits = write(&self.rate_limits)?;
        let state = limits
            .get_mut(key)
            .ok_or_else(|| anyhow!("no rate limit state for {}", key))?;
        state.requests_made += 1;
        Ok(())
    }

    async fn reset_window(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Result<()> {
        let mut limits = write(&self.rate_limits)?;
        if let Some(state) = limits.get_mut(key) {
            state.requests_made = 0;
            state.window_start = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::TimeZone;

    fn msg(id: &str, secs: i64, content: &str) -> CanonicalMessage {
        CanonicalMessage {
            id: id.into(),
            source_type: SourceType::GitHub,
            source_id: id.into(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            author_id: "user_github_alice".into(),
            content: content.into(),
            channel_id: "chan_github_octo_app".into(),
            thread_id: id.into(),
            parent_id: None,
            is_thread_root: true,
            mentions: Default::default(),
            urls: vec![],
            code_blocks: vec![],
            source_metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_save_message_updates_only_content_fields() {
        let store = InMemoryStore::new();
        store.save_message(&msg("m1", 100, "first")).await.unwrap();

        let mut changed = msg("m1", 999, "edited");
        changed.author_id = "user_github_mallory".into();
        store.save_message(&changed).await.unwrap();

        let stored = store.get_message("m1").await.unwrap().unwrap();
        assert_eq!(stored.content, "edited");
        assert_eq!(stored.timestamp.timestamp(), 100);
        assert_eq!(stored.author_id, "user_github_alice");
    }

    #[tokio::test]
    async fn test_select_messages_filters_and_orders() {
        let store = InMemoryStore::new();
        store.save_message(&msg("b", 200, "Deploy failed")).await.unwrap();
        store.save_message(&msg("a", 100, "deploy ok")).await.unwrap();
        store.save_message(&msg("c", 300, "unrelated")).await.unwrap();

        let q = MessageQuery {
            search: Some("DEPLOY".into()),
            ..Default::default()
        };
        let ids: Vec<_> = store
            .select_messages(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let q = MessageQuery {
            since: Some(Utc.timestamp_opt(150, 0).unwrap()),
            limit: Some(1),
            ..Default::default()
        };
        let ids: Vec<_> = store
            .select_messages(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["b"]);

        let q = MessageQuery {
            offset: Some(1),
            limit: Some(1),
            ..Default::default()
        };
        let ids: Vec<_> = store
            .select_messages(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(store.all_messages().await.unwrap().len(), 3);
    }

    async fn ids(store: &InMemoryStore, q: MessageQuery) -> Vec<String> {
        store
            .select_messages(&q)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect()
    }

    #[tokio::test]
    async fn test_enrichment_filters_exclude_unenriched() {
        let store = InMemoryStore::new();
        store.save_message(&msg("q", 100, "why?")).await.unwrap();
        store.save_message(&msg("s", 200, "statement")).await.unwrap();
        store.save_message(&msg("n", 300, "never enriched")).await.unwrap();
        for (id, is_question) in [("q", true), ("s", false)] {
            store
                .save_enrichment(&Enrichment {
                    message_id: id.into(),
                    is_question,
                    char_count: 4,
                    word_count: 1,
                    has_code: false,
                    has_links: false,
                    has_quotes: false,
                })
                .await
                .unwrap();
        }

        let questions = ids(
            &store,
            MessageQuery {
                is_question: Some(true),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(questions, vec!["q"]);
        let others = ids(
            &store,
            MessageQuery {
                is_question: Some(false),
                has_code: Some(false),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(others, vec!["s"]);
        assert_eq!(ids(&store, MessageQuery::default()).await.len(), 3);
        assert_eq!(store.counts().await.unwrap().enrichments, 2);
    }

    #[tokio::test]
    async fn test_classification_overwrites_per_type() {
        let store = InMemoryStore::new();
        let mut c = Classification {
            message_id: "m1".into(),
            kind: ClassificationType::Question,
            confidence: 0.4,
            signals: vec!["question_mark".into()],
        };
        store.save_classification(&c).await.unwrap();
        c.confidence = 0.9;
        store.save_classification(&c).await.unwrap();
        c.kind = ClassificationType::Solution;
        store.save_classification(&c).await.unwrap();

        let stored = store.classifications_for("m1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].kind, ClassificationType::Question);
        assert_eq!(stored[0].confidence, 0.9);
    }
}
