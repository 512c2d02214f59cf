//! Storage abstraction for canonical records.
//!
//! The [`Store`] trait is the persistence collaborator the fetch
//! orchestrator and the classify pipeline write through. Every write is an
//! upsert keyed by a deterministic id, so re-running a fetch is safe.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    CanonicalMessage, Channel, Classification, Enrichment, RawPayload, SourceType, User,
};

/// Filter for [`Store::select_messages`].
///
/// Results are ordered by timestamp, then id.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub source_type: Option<SourceType>,
    pub channel_id: Option<String>,
    pub author_id: Option<String>,
    pub thread_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on content.
    pub search: Option<String>,
    pub limit: Option<usize>,
    /// Rows skipped before `limit` applies.
    pub offset: Option<usize>,
    /// Enrichment filters. A message with no stored enrichment matches none
    /// of them, whichever value is asked for.
    pub is_question: Option<bool>,
    pub has_code: Option<bool>,
    pub has_links: Option<bool>,
    pub has_quotes: Option<bool>,
}

impl MessageQuery {
    /// In-process form of the filter, shared by stores without a query engine.
    pub fn matches(&self, m: &CanonicalMessage) -> bool {
        if self.source_type.is_some_and(|s| s != m.source_type) {
            return false;
        }
        if self.channel_id.as_ref().is_some_and(|c| c != &m.channel_id) {
            return false;
        }
        if self.author_id.as_ref().is_some_and(|a| a != &m.author_id) {
            return false;
        }
        if self.thread_id.as_ref().is_some_and(|t| t != &m.thread_id) {
            return false;
        }
        if self.since.is_some_and(|s| m.timestamp < s) {
            return false;
        }
        if self.until.is_some_and(|u| m.timestamp > u) {
            return false;
        }
        if let Some(needle) = &self.search {
            if !m.content.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }

    pub fn filters_enrichment(&self) -> bool {
        self.is_question.is_some()
            || self.has_code.is_some()
            || self.has_links.is_some()
            || self.has_quotes.is_some()
    }

    /// Enrichment half of the filter; `None` is a message never enriched.
    pub fn matches_enrichment(&self, e: Option<&Enrichment>) -> bool {
        if !self.filters_enrichment() {
            return true;
        }
        let Some(e) = e else {
            return false;
        };
        let want = |filter: Option<bool>, actual: bool| filter.map_or(true, |f| f == actual);
        want(self.is_question, e.is_question)
            && want(self.has_code, e.has_code)
            && want(self.has_links, e.has_links)
            && want(self.has_quotes, e.has_quotes)
    }
}

/// Row counts per table, for `loom stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub messages: i64,
    pub thread_roots: i64,
    pub users: i64,
    pub channels: i64,
    pub raw_payloads: i64,
    pub classifications: i64,
    pub enrichments: i64,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save_message`](Store::save_message) | Insert a message or update its content-derived fields |
/// | [`save_user`](Store::save_user) | Upsert an identity record |
/// | [`save_channel`](Store::save_channel) | Upsert a container record |
/// | [`save_raw_payload`](Store::save_raw_payload) | Keep the native JSON for provenance |
/// | [`save_classification`](Store::save_classification) | Overwrite one `(message, type)` label |
/// | [`save_enrichment`](Store::save_enrichment) | Overwrite a message's content facts |
/// | [`select_messages`](Store::select_messages) | Filtered, ordered message query |
/// | [`all_messages`](Store::all_messages) | Everything, for graph rebuilds |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `msg`, or on an existing id update only content-derived
    /// fields (content, mentions, urls, code blocks, metadata).
    async fn save_message(&self, msg: &CanonicalMessage) -> Result<()>;

    async fn save_user(&self, user: &User) -> Result<()>;

    async fn save_channel(&self, channel: &Channel) -> Result<()>;

    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()>;

    async fn save_classification(&self, classification: &Classification) -> Result<()>;

    async fn save_enrichment(&self, enrichment: &Enrichment) -> Result<()>;

    async fn get_message(&self, id: &str) -> Result<Option<CanonicalMessage>>;

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<CanonicalMessage>>;

    /// Every stored message, ordered by timestamp then id.
    async fn all_messages(&self) -> Result<Vec<CanonicalMessage>> {
        self.select_messages(&MessageQuery::default()).await
    }

    async fn classifications_for(&self, message_id: &str) -> Result<Vec<Classification>>;

    async fn enrichment_for(&self, message_id: &str) -> Result<Option<Enrichment>>;

    async fn counts(&self) -> Result<StoreCounts>;
}
