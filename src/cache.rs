//! Cache-aside JSON snapshots of thread sub-resources.
//!
//! [`CachedSlack`] and [`CachedGitHub`] wrap a source client and serve
//! thread replies and per-thread sub-resources from `[cache] dir` when a
//! fresh snapshot exists. Searches always go to the source.
//!
//! A snapshot is fresh when it is at most `max_age_secs` old and, if the
//! thread's last-modified time is known, was fetched at or after it.
//! Snapshots are written to a temporary file and renamed into place.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use threadloom_core::error::FetchError;
use threadloom_core::normalize::{
    Comment, Discussion, DiscussionComment, Issue, Review, ReviewComment, SlackMessage,
    ThreadAnchor, TimelineEvent,
};
use threadloom_core::source::{GitHubSource, SlackIdentity, SlackSource};

use crate::config::CacheConfig;

const MAX_AGE_CAP_SECS: u64 = 1 << 40;

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Snapshot<T> {
    key: String,
    fetched_at: DateTime<Utc>,
    items: Vec<T>,
}

/// Whether a snapshot fetched at `fetched_at` may serve a request at `now`.
pub fn is_fresh(
    fetched_at: DateTime<Utc>,
    now: DateTime<Utc>,
    max_age: Duration,
    modified_at: Option<DateTime<Utc>>,
) -> bool {
    if now - fetched_at > max_age {
        return false;
    }
    modified_at.map_or(true, |m| fetched_at >= m)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub snapshots: usize,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
    max_age: Duration,
}

impl SnapshotCache {
    pub fn new(dir: impl Into<PathBuf>, max_age_secs: u64) -> Self {
        Self {
            dir: dir.into(),
            max_age: Duration::seconds(max_age_secs.min(MAX_AGE_CAP_SECS) as i64),
        }
    }

    /// `None` when the cache is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(&config.dir, config.max_age_secs))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    /// Cached items for `key`, if a fresh snapshot exists.
    pub fn load<T: DeserializeOwned>(
        &self,
        key: &str,
        modified_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Vec<T>> {
        let path = self.path(key);
        let bytes = std::fs::read(&path).ok()?;
        let snapshot: Snapshot<T> = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable snapshot");
                return None;
            }
        };
        if snapshot.key != key || !is_fresh(snapshot.fetched_at, now, self.max_age, modified_at) {
            debug!(key, "snapshot stale");
            return None;
        }
        debug!(key, "snapshot hit");
        Some(snapshot.items)
    }

    pub fn store<T: Serialize>(&self, key: &str, items: &[T], now: DateTime<Utc>) -> Result<()> {
        #[derive(Serialize)]
        struct SnapshotRef<'a, T> {
            key: &'a str,
            fetched_at: DateTime<Utc>,
            items: &'a [T],
        }
        let bytes = serde_json::to_vec(&SnapshotRef {
            key,
            fetched_at: now,
            items,
        })?;
        write_atomic(&self.path(key), &bytes)
    }

    fn snapshot_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read cache dir {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for path in self.snapshot_files()? {
            let meta = std::fs::metadata(&path)?;
            stats.snapshots += 1;
            stats.bytes += meta.len();
            if let Ok(modified) = meta.modified() {
                let modified: DateTime<Utc> = modified.into();
                stats.oldest = Some(stats.oldest.map_or(modified, |o| o.min(modified)));
                stats.newest = Some(stats.newest.map_or(modified, |n| n.max(modified)));
            }
        }
        Ok(stats)
    }

    /// Remove every snapshot; returns how many were deleted.
    pub fn clear(&self) -> Result<usize> {
        let files = self.snapshot_files()?;
        for path in &files {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(files.len())
    }

    /// Serve `key` from the cache, or call `fetch` and write the result back.
    async fn through<T, F>(
        &self,
        key: &str,
        modified_at: Option<DateTime<Utc>>,
        fetch: F,
    ) -> Result<Vec<T>, FetchError>
    where
        T: Serialize + DeserializeOwned,
        F: std::future::Future<Output = Result<Vec<T>, FetchError>>,
    {
        let now = Utc::now();
        if let Some(items) = self.load(key, modified_at, now) {
            return Ok(items);
        }
        let items = fetch.await?;
        if let Err(e) = self.store(key, &items, now) {
            warn!(key, error = %format!("{:#}", e), "failed to write snapshot");
        }
        Ok(items)
    }
}

/// [`SlackSource`] with cached thread replies.
pub struct CachedSlack<S> {
    inner: S,
    cache: SnapshotCache,
    team_id: OnceLock<String>,
}

impl<S: SlackSource> CachedSlack<S> {
    pub fn new(inner: S, cache: SnapshotCache) -> Self {
        Self {
            inner,
            cache,
            team_id: OnceLock::new(),
        }
    }
}

#[async_trait]
impl<S: SlackSource> SlackSource for CachedSlack<S> {
    async fn identity(&self) -> Result<SlackIdentity, FetchError> {
        let identity = self.inner.identity().await?;
        let _ = self.team_id.set(identity.team_id.clone());
        Ok(identity)
    }

    async fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SlackMessage>, FetchError> {
        self.inner.search_messages(query, limit).await
    }

    async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, FetchError> {
        let team = self.team_id.get().map(String::as_str).unwrap_or("unknown");
        let key = format!("slack_{}_{}_{}_replies", team, channel_id, thread_ts);
        self.cache
            .through(&key, None, self.inner.thread_replies(channel_id, thread_ts))
            .await
    }
}

/// [`GitHubSource`] with cached per-thread sub-resources.
pub struct CachedGitHub<S> {
    inner: S,
    cache: SnapshotCache,
}

impl<S: GitHubSource> CachedGitHub<S> {
    pub fn new(inner: S, cache: SnapshotCache) -> Self {
        Self { inner, cache }
    }
}

fn anchor_key(anchor: &ThreadAnchor, resource: &str) -> String {
    format!("{}_{}", anchor.root_id(), resource)
}

#[async_trait]
impl<S: GitHubSource> GitHubSource for CachedGitHub<S> {
    async fn viewer(&self) -> Result<String, FetchError> {
        self.inner.viewer().await
    }

    async fn search_issues(&self, query: &str, limit: usize) -> Result<Vec<Issue>, FetchError> {
        self.inner.search_issues(query, limit).await
    }

    async fn comments(&self, anchor: &ThreadAnchor) -> Result<Vec<Comment>, FetchError> {
        self.cache
            .through(&anchor_key(anchor, "comments"), anchor.updated_at, self.inner.comments(anchor))
            .await
    }

    async fn reviews(&self, anchor: &ThreadAnchor) -> Result<Vec<Review>, FetchError> {
        self.cache
            .through(&anchor_key(anchor, "reviews"), anchor.updated_at, self.inner.reviews(anchor))
            .await
    }

    async fn review_comments(
        &self,
        anchor: &ThreadAnchor,
    ) -> Result<Vec<ReviewComment>, FetchError> {
        self.cache
            .through(
                &anchor_key(anchor, "review_comments"),
                anchor.updated_at,
                self.inner.review_comments(anchor),
            )
            .await
    }

    async fn timeline(&self, anchor: &ThreadAnchor) -> Result<Vec<TimelineEvent>, FetchError> {
        self.cache
            .through(&anchor_key(anchor, "timeline"), anchor.updated_at, self.inner.timeline(anchor))
            .await
    }

    async fn search_discussions(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Discussion>, FetchError> {
        self.inner.search_discussions(query, limit).await
    }

    async fn discussion_comments(
        &self,
        anchor: &ThreadAnchor,
    ) -> Result<Vec<DiscussionComment>, FetchError> {
        self.cache
            .through(
                &anchor_key(anchor, "comments"),
                anchor.updated_at,
                self.inner.discussion_comments(anchor),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use threadloom_core::normalize::{RepoRef, ThreadKind};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_freshness_rule() {
        let max_age = Duration::seconds(3600);
        assert!(is_fresh(ts(1000), ts(1000 + 3600), max_age, None));
        assert!(!is_fresh(ts(1000), ts(1000 + 3601), max_age, None));
        assert!(is_fresh(ts(1000), ts(1500), max_age, Some(ts(900))));
        assert!(!is_fresh(ts(1000), ts(1500), max_age, Some(ts(1200))));
    }

    #[test]
    fn test_store_load_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path(), 3600);
        cache.store("a/b c", &[1, 2, 3], ts(1000)).unwrap();

        let hit: Option<Vec<i32>> = cache.load("a/b c", None, ts(1100));
        assert_eq!(hit, Some(vec![1, 2, 3]));
        let stale: Option<Vec<i32>> = cache.load("a/b c", None, ts(9000));
        assert_eq!(stale, None);
        let missing: Option<Vec<i32>> = cache.load("other", None, ts(1100));
        assert_eq!(missing, None);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.snapshots, 1);
        assert!(stats.bytes > 0);
        assert!(!dir.path().join("a_b_c.json.tmp").exists());

        assert_eq!(cache.clear().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().snapshots, 0);
    }

    #[test]
    fn test_stats_on_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("absent"), 60);
        assert_eq!(cache.stats().unwrap().snapshots, 0);
        assert_eq!(cache.clear().unwrap(), 0);
    }

    struct CountingGitHub {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl GitHubSource for CountingGitHub {
        async fn viewer(&self) -> Result<String, FetchError> {
            Ok("bot".into())
        }
        async fn search_issues(&self, _q: &str, _l: usize) -> Result<Vec<Issue>, FetchError> {
            Ok(vec![])
        }
        async fn comments(&self, anchor: &ThreadAnchor) -> Result<Vec<Comment>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Comment {
                id: anchor.number,
                body: Some("hello".into()),
                user: None,
                created_at: "2024-03-01T10:00:00Z".into(),
                updated_at: None,
                html_url: None,
            }])
        }
        async fn reviews(&self, _a: &ThreadAnchor) -> Result<Vec<Review>, FetchError> {
            Ok(vec![])
        }
        async fn review_comments(&self, _a: &ThreadAnchor) -> Result<Vec<ReviewComment>, FetchError> {
            Ok(vec![])
        }
        async fn timeline(&self, _a: &ThreadAnchor) -> Result<Vec<TimelineEvent>, FetchError> {
            Ok(vec![])
        }
        async fn search_discussions(&self, _q: &str, _l: usize) -> Result<Vec<Discussion>, FetchError> {
            Ok(vec![])
        }
        async fn discussion_comments(
            &self,
            _a: &ThreadAnchor,
        ) -> Result<Vec<DiscussionComment>, FetchError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_cached_github_serves_second_call_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = CachedGitHub::new(
            CountingGitHub {
                calls: AtomicUsize::new(0),
            },
            SnapshotCache::new(dir.path(), 3600),
        );
        let mut anchor = ThreadAnchor {
            repo: RepoRef::new("octo", "app"),
            kind: ThreadKind::Issue,
            number: 3,
            updated_at: None,
        };

        assert_eq!(source.comments(&anchor).await.unwrap().len(), 1);
        assert_eq!(source.comments(&anchor).await.unwrap().len(), 1);
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);

        // Thread modified after the snapshot was taken.
        anchor.updated_at = Some(Utc::now() + Duration::seconds(60));
        source.comments(&anchor).await.unwrap();
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 2);
    }
}
