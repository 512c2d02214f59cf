use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            display_name TEXT,
            real_name TEXT,
            email TEXT,
            avatar_url TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            workspace_id TEXT,
            name TEXT NOT NULL,
            display_name TEXT,
            kind TEXT NOT NULL,
            is_private INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            source_id TEXT NOT NULL,
            timestamp_us INTEGER NOT NULL,
            author_id TEXT NOT NULL,
            content TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            thread_id TEXT NOT NULL,
            parent_id TEXT,
            is_thread_root INTEGER NOT NULL DEFAULT 0,
            mentions TEXT NOT NULL DEFAULT '[]',
            urls TEXT NOT NULL DEFAULT '[]',
            code_blocks TEXT NOT NULL DEFAULT '[]',
            source_metadata TEXT NOT NULL DEFAULT '{}',
            normalized_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_messages (
            id TEXT PRIMARY KEY,
            source_type TEXT NOT NULL,
            native_id TEXT NOT NULL,
            blob TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            fetched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classifications (
            message_id TEXT NOT NULL,
            type TEXT NOT NULL,
            confidence REAL NOT NULL,
            signals TEXT NOT NULL DEFAULT '[]',
            classified_at INTEGER NOT NULL,
            PRIMARY KEY (message_id, type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichments (
            message_id TEXT PRIMARY KEY,
            is_question INTEGER NOT NULL,
            char_count INTEGER NOT NULL,
            word_count INTEGER NOT NULL,
            has_code INTEGER NOT NULL,
            has_links INTEGER NOT NULL,
            has_quotes INTEGER NOT NULL,
            enriched_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // workspace_id is '' when absent so the key stays unique.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limits (
            source_type TEXT NOT NULL,
            workspace_id TEXT NOT NULL DEFAULT '',
            endpoint TEXT NOT NULL,
            requests_made INTEGER NOT NULL DEFAULT 0,
            window_start_us INTEGER NOT NULL,
            window_secs INTEGER NOT NULL,
            max_requests INTEGER NOT NULL,
            safety_limit INTEGER NOT NULL,
            PRIMARY KEY (source_type, workspace_id, endpoint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_channel_id ON messages(channel_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_author_id ON messages(author_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp_us)",
        "CREATE INDEX IF NOT EXISTS idx_classifications_type ON classifications(type)",
    ] {
        sqlx::query(index).execute(pool).await?;
    }

    Ok(())
}
