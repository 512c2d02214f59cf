//! Database statistics and health overview.
//!
//! `loom stats` summarizes what has been fetched and derived: record
//! counts, classification labels per type, and the state of every
//! persisted rate-limit window. `loom cache stats` reports on the snapshot
//! directory.

use anyhow::Result;
use chrono::{DateTime, Utc};

use threadloom_core::ratelimit::WindowPhase;
use threadloom_core::store::Store;

use crate::cache::SnapshotCache;
use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let counts = store.counts().await?;
    let by_type = store.classification_counts().await?;
    let windows = store.rate_limit_windows().await?;
    let last_normalized: Option<i64> = sqlx::query_scalar("SELECT MAX(normalized_at) FROM messages")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);
    let now = Utc::now();

    println!("Threadloom — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Messages:    {}", counts.messages);
    println!("  Threads:     {}", counts.thread_roots);
    println!("  Users:       {}", counts.users);
    println!("  Channels:    {}", counts.channels);
    println!("  Raw:         {}", counts.raw_payloads);
    println!(
        "  Last fetch:  {}",
        last_normalized
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|ts| format_ts_relative(ts, now))
            .unwrap_or_else(|| "never".to_string())
    );

    println!();
    println!("  Classifications: {}", counts.classifications);
    for (kind, n) in &by_type {
        println!("    {:<16} {:>8}", kind.as_str(), n);
    }
    println!("  Enriched:    {}", counts.enrichments);

    if !windows.is_empty() {
        println!();
        println!("  Rate limits:");
        println!(
            "  {:<44} {:>6} {:>6} {:>6}   {}",
            "KEY", "USED", "SAFE", "MAX", "WINDOW"
        );
        println!("  {}", "-".repeat(84));
        for (key, state) in &windows {
            let window = match state.phase(now) {
                WindowPhase::WindowExpired => "expired".to_string(),
                WindowPhase::LimitReached => format!(
                    "exhausted, started {}",
                    format_ts_relative(state.window_start, now)
                ),
                WindowPhase::WithinWindow => {
                    format!("started {}", format_ts_relative(state.window_start, now))
                }
            };
            println!(
                "  {:<44} {:>6} {:>6} {:>6}   {}",
                key.to_string(),
                state.requests_made,
                state.safety_limit,
                state.max_requests,
                window
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

pub fn run_cache_stats(config: &Config) -> Result<()> {
    let Some(cache) = SnapshotCache::from_config(&config.cache) else {
        println!("Snapshot cache disabled ([cache] enabled = false).");
        return Ok(());
    };
    let stats = cache.stats()?;
    let now = Utc::now();
    println!("  Directory:   {}", cache.dir().display());
    println!("  Snapshots:   {}", stats.snapshots);
    println!("  Size:        {}", format_bytes(stats.bytes));
    if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
        println!("  Oldest:      {}", format_ts_relative(oldest, now));
        println!("  Newest:      {}", format_ts_relative(newest, now));
    }
    Ok(())
}

pub fn run_cache_clear(config: &Config) -> Result<()> {
    // Clearing ignores `enabled` so stale snapshots can still be removed.
    let cache = SnapshotCache::new(&config.cache.dir, config.cache.max_age_secs);
    let removed = cache.clear()?;
    println!("Removed {} snapshot(s) from {}", removed, cache.dir().display());
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, plural(mins))
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, plural(hours))
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, plural(days))
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}
