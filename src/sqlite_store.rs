//! SQLite implementation of the core [`Store`] and [`RateLimitStore`] traits.
//!
//! Timestamps are stored as integers: message timestamps and rate-limit
//! window starts in microseconds (both carry sub-second precision),
//! bookkeeping columns in seconds. Set-valued and structured columns are JSON text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use threadloom_core::models::{
    CanonicalMessage, Channel, Classification, ClassificationType, Enrichment, RawPayload, User,
};
use threadloom_core::ratelimit::{RateLimitKey, RateLimitState, RateLimitStore};
use threadloom_core::store::{MessageQuery, Store, StoreCounts};

const MESSAGE_COLUMNS: &str = "id, source_type, source_id, timestamp_us, author_id, content, \
    channel_id, thread_id, parent_id, is_thread_root, mentions, urls, code_blocks, source_metadata";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Per-type classification counts, in [`ClassificationType::ALL`] order.
    pub async fn classification_counts(&self) -> Result<Vec<(ClassificationType, i64)>> {
        let mut out = Vec::with_capacity(ClassificationType::ALL.len());
        for kind in ClassificationType::ALL {
            let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM classifications WHERE type = ?")
                .bind(kind.as_str())
                .fetch_one(&self.pool)
                .await?;
            out.push((kind, n));
        }
        Ok(out)
    }

    /// Every persisted rate-limit window.
    pub async fn rate_limit_windows(&self) -> Result<Vec<(RateLimitKey, RateLimitState)>> {
        let rows = sqlx::query(
            "SELECT source_type, workspace_id, endpoint, requests_made, window_start_us, window_secs, \
             max_requests, safety_limit FROM rate_limits ORDER BY source_type, workspace_id, endpoint",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(RateLimitKey, RateLimitState)> {
                let source: String = row.get("source_type");
                let workspace: String = row.get("workspace_id");
                let key = RateLimitKey::new(
                    source.parse()?,
                    Some(workspace).filter(|w| !w.is_empty()),
                    row.get::<String, _>("endpoint"),
                );
                Ok((key, state_from_row(row)?))
            })
            .collect()
    }
}

fn utc_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("timestamp out of range: {}us", micros))
}

fn message_from_row(row: &SqliteRow) -> Result<CanonicalMessage> {
    let id: String = row.get("id");
    let source_type: String = row.get("source_type");
    let micros: i64 = row.get("timestamp_us");
    let mentions: String = row.get("mentions");
    let urls: String = row.get("urls");
    let code_blocks: String = row.get("code_blocks");
    let metadata: String = row.get("source_metadata");

    Ok(CanonicalMessage {
        source_type: source_type.parse()?,
        source_id: row.get("source_id"),
        timestamp: utc_micros(micros)
            .with_context(|| format!("message {} has an invalid timestamp", id))?,
        author_id: row.get("author_id"),
        content: row.get("content"),
        channel_id: row.get("channel_id"),
        thread_id: row.get("thread_id"),
        parent_id: row.get("parent_id"),
        is_thread_root: row.get("is_thread_root"),
        mentions: serde_json::from_str(&mentions)?,
        urls: serde_json::from_str(&urls)?,
        code_blocks: serde_json::from_str(&code_blocks)?,
        source_metadata: serde_json::from_str(&metadata)?,
        id,
    })
}

fn state_from_row(row: &SqliteRow) -> Result<RateLimitState> {
    let requests_made: i64 = row.get("requests_made");
    let max_requests: i64 = row.get("max_requests");
    let safety_limit: i64 = row.get("safety_limit");
    Ok(RateLimitState {
        requests_made: u32::try_from(requests_made)?,
        window_start: utc_micros(row.get("window_start_us"))?,
        window_secs: row.get("window_secs"),
        max_requests: u32::try_from(max_requests)?,
        safety_limit: u32::try_from(safety_limit)?,
    })
}

fn workspace_column(key: &RateLimitKey) -> &str {
    key.workspace_id.as_deref().unwrap_or("")
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_message(&self, msg: &CanonicalMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, source_type, source_id, timestamp_us, author_id, content,
                channel_id, thread_id, parent_id, is_thread_root, mentions, urls, code_blocks,
                source_metadata, normalized_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                mentions = excluded.mentions,
                urls = excluded.urls,
                code_blocks = excluded.code_blocks,
                source_metadata = excluded.source_metadata,
                normalized_at = excluded.normalized_at
            "#,
        )
        .bind(&msg.id)
        .bind(msg.source_type.as_str())
        .bind(&msg.source_id)
        .bind(msg.timestamp.timestamp_micros())
        .bind(&msg.author_id)
        .bind(&msg.content)
        .bind(&msg.channel_id)
        .bind(&msg.thread_id)
        .bind(&msg.parent_id)
        .bind(msg.is_thread_root)
        .bind(serde_json::to_string(&msg.mentions)?)
        .bind(serde_json::to_string(&msg.urls)?)
        .bind(serde_json::to_string(&msg.code_blocks)?)
        .bind(serde_json::to_string(&msg.source_metadata)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save message {}", msg.id))?;
        Ok(())
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, source_type, source_id, display_name, real_name, email, avatar_url, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                real_name = COALESCE(excluded.real_name, users.real_name),
                email = COALESCE(excluded.email, users.email),
                avatar_url = COALESCE(excluded.avatar_url, users.avatar_url),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&user.id)
        .bind(user.source_type.as_str())
        .bind(&user.source_id)
        .bind(&user.display_name)
        .bind(&user.real_name)
        .bind(&user.email)
        .bind(&user.avatar_url)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, source_type, source_id, workspace_id, name, display_name, kind, is_private, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workspace_id = excluded.workspace_id,
                name = excluded.name,
                display_name = excluded.display_name,
                kind = excluded.kind,
                is_private = excluded.is_private,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&channel.id)
        .bind(channel.source_type.as_str())
        .bind(&channel.source_id)
        .bind(&channel.workspace_id)
        .bind(&channel.name)
        .bind(&channel.display_name)
        .bind(&channel.kind)
        .bind(channel.is_private)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_raw_payload(&self, raw: &RawPayload) -> Result<()> {
        let mut hasher = Sha256::new();
        hasher.update(raw.blob.as_bytes());
        let content_hash = format!("{:x}", hasher.finalize());

        sqlx::query(
            r#"
            INSERT INTO raw_messages (id, source_type, native_id, blob, content_hash, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                native_id = excluded.native_id,
                blob = excluded.blob,
                content_hash = excluded.content_hash,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&raw.id)
        .bind(raw.source_type.as_str())
        .bind(&raw.native_id)
        .bind(&raw.blob)
        .bind(&content_hash)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_classification(&self, classification: &Classification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO classifications (message_id, type, confidence, signals, classified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(message_id, type) DO UPDATE SET
                confidence = excluded.confidence,
                signals = excluded.signals,
                classified_at = excluded.classified_at
            "#,
        )
        .bind(&classification.message_id)
        .bind(classification.kind.as_str())
        .bind(classification.confidence)
        .bind(serde_json::to_string(&classification.signals)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_enrichment(&self, enrichment: &Enrichment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO enrichments (message_id, is_question, char_count, word_count,
                has_code, has_links, has_quotes, enriched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                is_question = excluded.is_question,
                char_count = excluded.char_count,
                word_count = excluded.word_count,
                has_code = excluded.has_code,
                has_links = excluded.has_links,
                has_quotes = excluded.has_quotes,
                enriched_at = excluded.enriched_at
            "#,
        )
        .bind(&enrichment.message_id)
        .bind(enrichment.is_question)
        .bind(i64::try_from(enrichment.char_count)?)
        .bind(i64::try_from(enrichment.word_count)?)
        .bind(enrichment.has_code)
        .bind(enrichment.has_links)
        .bind(enrichment.has_quotes)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save enrichment for {}", enrichment.message_id))?;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<CanonicalMessage>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn select_messages(&self, query: &MessageQuery) -> Result<Vec<CanonicalMessage>> {
        let sql = format!(
            r#"
            SELECT {} FROM messages
            LEFT JOIN enrichments e ON e.message_id = messages.id
            WHERE (?1 IS NULL OR source_type = ?1)
              AND (?2 IS NULL OR channel_id = ?2)
              AND (?3 IS NULL OR author_id = ?3)
              AND (?4 IS NULL OR thread_id = ?4)
              AND (?5 IS NULL OR timestamp_us >= ?5)
              AND (?6 IS NULL OR timestamp_us <= ?6)
              AND (?7 IS NULL OR instr(lower(content), lower(?7)) > 0)
              AND (?10 IS NULL OR e.is_question = ?10)
              AND (?11 IS NULL OR e.has_code = ?11)
              AND (?12 IS NULL OR e.has_links = ?12)
              AND (?13 IS NULL OR e.has_quotes = ?13)
            ORDER BY timestamp_us ASC, id ASC
            LIMIT ?8 OFFSET ?9
            "#,
            MESSAGE_COLUMNS
        );
        let limit = query
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let offset = query
            .offset
            .map(|o| i64::try_from(o).unwrap_or(i64::MAX))
            .unwrap_or(0);

        let rows = sqlx::query(&sql)
            .bind(query.source_type.map(|s| s.as_str()))
            .bind(&query.channel_id)
            .bind(&query.author_id)
            .bind(&query.thread_id)
            .bind(query.since.map(|t| t.timestamp_micros()))
            .bind(query.until.map(|t| t.timestamp_micros()))
            .bind(&query.search)
            .bind(limit)
            .bind(offset)
            .bind(query.is_question)
            .bind(query.has_code)
            .bind(query.has_links)
            .bind(query.has_quotes)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn classifications_for(&self, message_id: &str) -> Result<Vec<Classification>> {
        let rows = sqlx::query(
            "SELECT message_id, type, confidence, signals FROM classifications WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = rows
            .iter()
            .map(|row| -> Result<Classification> {
                let kind: String = row.get("type");
                let signals: String = row.get("signals");
                Ok(Classification {
                    message_id: row.get("message_id"),
                    kind: kind.parse()?,
                    confidence: row.get("confidence"),
                    signals: serde_json::from_str(&signals)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        out.sort_by_key(|c| c.kind);
        Ok(out)
    }

    async fn enrichment_for(&self, message_id: &str) -> Result<Option<Enrichment>> {
        let row = sqlx::query(
            "SELECT message_id, is_question, char_count, word_count, has_code, has_links, has_quotes \
             FROM enrichments WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Enrichment> {
            Ok(Enrichment {
                message_id: row.get("message_id"),
                is_question: row.get("is_question"),
                char_count: usize::try_from(row.get::<i64, _>("char_count"))?,
                word_count: usize::try_from(row.get::<i64, _>("word_count"))?,
                has_code: row.get("has_code"),
                has_links: row.get("has_links"),
                has_quotes: row.get("has_quotes"),
            })
        })
        .transpose()
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: &'static str| async move {
            sqlx::query_scalar::<_, i64>(sql)
                .fetch_one(&self.pool)
                .await
        };
        Ok(StoreCounts {
            messages: count("SELECT COUNT(*) FROM messages").await?,
            thread_roots: count("SELECT COUNT(*) FROM messages WHERE is_thread_root = 1").await?,
            users: count("SELECT COUNT(*) FROM users").await?,
            channels: count("SELECT COUNT(*) FROM channels").await?,
            raw_payloads: count("SELECT COUNT(*) FROM raw_messages").await?,
            classifications: count("SELECT COUNT(*) FROM classifications").await?,
            enrichments: count("SELECT COUNT(*) FROM enrichments").await?,
        })
    }
}

#[async_trait]
impl RateLimitStore for SqliteStore {
    async fn init_rate_limit(&self, key: &RateLimitKey, state: &RateLimitState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (source_type, workspace_id, endpoint, requests_made,
                window_start_us, window_secs, max_requests, safety_limit)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_type, workspace_id, endpoint) DO NOTHING
            "#,
        )
        .bind(key.source_type.as_str())
        .bind(workspace_column(key))
        .bind(&key.endpoint)
        .bind(i64::from(state.requests_made))
        .bind(state.window_start.timestamp_micros())
        .bind(state.window_secs)
        .bind(i64::from(state.max_requests))
        .bind(i64::from(state.safety_limit))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_rate_limit(&self, key: &RateLimitKey) -> Result<Option<RateLimitState>> {
        let row = sqlx::query(
            "SELECT requests_made, window_start_us, window_secs, max_requests, safety_limit \
             FROM rate_limits WHERE source_type = ? AND workspace_id = ? AND endpoint = ?",
        )
        .bind(key.source_type.as_str())
        .bind(workspace_column(key))
        .bind(&key.endpoint)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn record_request(&self, key: &RateLimitKey) -> Result<()> {
        let result = sqlx::query(
            "UPDATE rate_limits SET requests_made = requests_made + 1 \
             WHERE source_type = ? AND workspace_id = ? AND endpoint = ?",
        )
        .bind(key.source_type.as_str())
        .bind(workspace_column(key))
        .bind(&key.endpoint)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no rate limit state for {}", key);
        }
        Ok(())
    }

    async fn reset_window(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE rate_limits SET requests_made = 0, window_start_us = ? \
             WHERE source_type = ? AND workspace_id = ? AND endpoint = ?",
        )
        .bind(now.timestamp_micros())
        .bind(key.source_type.as_str())
        .bind(workspace_column(key))
        .bind(&key.endpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
