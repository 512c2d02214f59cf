//! Fetch orchestration: filter to query, rate-limit gate, source call,
//! normalization, persistence.
//!
//! Each run returns a [`FetchSummary`] instead of pass/fail. Only
//! authentication failures (and an unusable filter) abort a run. A rate
//! limit stops the batch early and keeps what was stored. Network,
//! normalization and persistence failures skip the one item involved.

use std::collections::{HashMap, HashSet};
use std::future::Future;

use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::models::SourceType;
use crate::normalize::{
    github_workspace_id, normalize, slack_workspace_id, NativeRecord, RepoRef, SlackChannelRef,
    SlackMessage, ThreadAnchor, ThreadKind,
};
use crate::ratelimit::{endpoints, RateLimitKey, RateLimitPolicies, RateLimitStore, RateLimiter};
use crate::source::{GitHubSource, SlackSource};
use crate::store::Store;

pub const DEFAULT_LIMIT: usize = 100;

/// Parse `Nd` (days ago), `Nw` (weeks ago) or `YYYY-MM-DD`.
pub fn parse_date_spec(spec: &str, today: NaiveDate) -> Result<NaiveDate> {
    let spec = spec.trim();
    let relative = |suffix: char, days_per_unit: i64| -> Option<Result<NaiveDate>> {
        let n = spec.strip_suffix(suffix)?;
        Some(
            n.parse::<i64>()
                .ok()
                .filter(|n| *n >= 0)
                .map(|n| today - Duration::days(n * days_per_unit))
                .with_context(|| format!("Invalid relative date '{}'", spec)),
        )
    };
    if let Some(parsed) = relative('d', 1).or_else(|| relative('w', 7)) {
        return parsed;
    }
    NaiveDate::parse_from_str(spec, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected Nd, Nw or YYYY-MM-DD", spec))
}

/// Criteria for a chat-source fetch.
#[derive(Debug, Clone)]
pub struct SlackFetchFilter {
    pub user: Option<String>,
    pub channel: Option<String>,
    pub search: Option<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub limit: usize,
    /// Complete each matched thread with a replies call.
    pub fetch_threads: bool,
}

impl Default for SlackFetchFilter {
    fn default() -> Self {
        Self {
            user: None,
            channel: None,
            search: None,
            since: None,
            until: None,
            limit: DEFAULT_LIMIT,
            fetch_threads: true,
        }
    }
}

impl SlackFetchFilter {
    /// Search-modifier query. `after:`/`before:` are exclusive, so the
    /// bounds are widened by a day to include `since` and `until` themselves.
    pub fn build_query(&self) -> Result<String> {
        let mut parts = Vec::new();
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            parts.push(format!("from:@{}", user.trim_start_matches('@')));
        }
        if let Some(channel) = self.channel.as_deref().filter(|c| !c.is_empty()) {
            let looks_like_id = channel.len() > 1
                && channel.starts_with(['C', 'D', 'G'])
                && channel.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            if looks_like_id || channel.starts_with('#') || channel.starts_with('@') {
                parts.push(format!("in:{}", channel));
            } else {
                parts.push(format!("in:#{}", channel));
            }
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(search.trim().to_string());
        }
        if let Some(since) = self.since {
            parts.push(format!("after:{}", (since - Duration::days(1)).format("%Y-%m-%d")));
        }
        if let Some(until) = self.until {
            parts.push(format!("before:{}", (until + Duration::days(1)).format("%Y-%m-%d")));
        }
        if parts.is_empty() {
            bail!("At least one of user, channel, search, since or until is required");
        }
        Ok(parts.join(" "))
    }
}

/// Which issue-like roots a GitHub fetch selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IssueKind {
    #[default]
    All,
    Issues,
    PullRequests,
}

/// Criteria for an issue/PR-source fetch.
#[derive(Debug, Clone)]
pub struct GitHubFetchFilter {
    /// User or organization; required.
    pub owner: String,
    /// Restrict to one repository of `owner`.
    pub repo: Option<String>,
    pub author: Option<String>,
    pub commenter: Option<String>,
    pub label: Option<String>,
    pub search: Option<String>,
    pub since: Option<NaiveDate>,
    pub kind: IssueKind,
    pub limit: usize,
    pub include_discussions: bool,
}

impl Default for GitHubFetchFilter {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: None,
            author: None,
            commenter: None,
            label: None,
            search: None,
            since: None,
            kind: IssueKind::All,
            limit: DEFAULT_LIMIT,
            include_discussions: false,
        }
    }
}

fn quote_if_spaced(value: &str) -> String {
    if value.contains(char::is_whitespace) {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

impl GitHubFetchFilter {
    pub fn repo_ref(&self) -> Option<RepoRef> {
        self.repo
            .as_deref()
            .filter(|r| !r.is_empty())
            .map(|r| RepoRef::new(self.owner.clone(), r))
    }

    fn scope(&self) -> Result<String> {
        if self.owner.trim().is_empty() {
            bail!("GitHub fetch requires an owner (user or organization)");
        }
        Ok(match self.repo_ref() {
            Some(repo) => format!("repo:{}", repo),
            None => format!("org:{}", self.owner),
        })
    }

    /// Search query for issues and pull requests.
    pub fn build_issue_query(&self) -> Result<String> {
        let mut parts = vec![self.scope()?];
        if let Some(author) = &self.author {
            parts.push(format!("author:{}", author));
        }
        if let Some(commenter) = &self.commenter {
            parts.push(format!("commenter:{}", commenter));
        }
        if let Some(label) = &self.label {
            parts.push(format!("label:{}", quote_if_spaced(label)));
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(search.trim().to_string());
        }
        if let Some(since) = self.since {
            parts.push(format!("updated:>={}", since.format("%Y-%m-%d")));
        }
        match self.kind {
            IssueKind::Issues => parts.push("is:issue".into()),
            IssueKind::PullRequests => parts.push("is:pr".into()),
            IssueKind::All => {}
        }
        Ok(parts.join(" "))
    }

    /// Search query for discussions. Author and label filters do not apply.
    pub fn build_discussion_query(&self) -> Result<String> {
        let mut parts = vec![self.scope()?];
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(search.trim().to_string());
        }
        if let Some(since) = self.since {
            parts.push(format!("updated:>={}", since.format("%Y-%m-%d")));
        }
        Ok(parts.join(" "))
    }
}

/// An item that was not stored, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub id: String,
    pub reason: String,
}

/// Outcome of one fetch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub source: SourceType,
    pub query: String,
    pub messages_stored: usize,
    pub threads_processed: usize,
    pub skipped: Vec<SkippedItem>,
    pub warnings: Vec<String>,
    /// The batch ended before all matches were processed.
    pub stopped_early: bool,
}

impl FetchSummary {
    fn new(source: SourceType, query: String) -> Self {
        Self {
            source,
            query,
            messages_stored: 0,
            threads_processed: 0,
            skipped: Vec::new(),
            warnings: Vec::new(),
            stopped_early: false,
        }
    }
}

/// A single progress event for a fetch run.
#[derive(Clone, Debug)]
pub enum FetchProgressEvent {
    Searching { source: SourceType, query: String },
    Found { source: SourceType, count: usize },
    Processing { source: SourceType, n: usize, total: usize },
    Stopped { source: SourceType, reason: String },
}

/// Reports fetch progress. Implementations write to stderr (human or JSON).
pub trait FetchProgressReporter: Send + Sync {
    fn report(&self, event: FetchProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl FetchProgressReporter for NoProgress {
    fn report(&self, _event: FetchProgressEvent) {}
}

/// Collaborators shared by every fetch run.
pub struct FetchContext<'a> {
    pub store: &'a dyn Store,
    pub rate_limits: &'a dyn RateLimitStore,
    pub policies: &'a RateLimitPolicies,
    pub progress: &'a dyn FetchProgressReporter,
}

/// Outcome of one guarded source call.
enum Step<T> {
    Proceed(T),
    Skip,
    Stop,
}

struct Run<'a> {
    store: &'a dyn Store,
    limiter: RateLimiter<'a>,
    progress: &'a dyn FetchProgressReporter,
    summary: FetchSummary,
}

impl<'a> Run<'a> {
    fn new(ctx: &FetchContext<'a>, source: SourceType, query: String) -> Self {
        Self {
            store: ctx.store,
            limiter: RateLimiter::new(ctx.rate_limits, ctx.policies),
            progress: ctx.progress,
            summary: FetchSummary::new(source, query),
        }
    }

    fn warn(&mut self, message: String) {
        warn!(source = %self.summary.source, "{}", message);
        self.summary.warnings.push(message);
    }

    fn skip(&mut self, id: String, reason: String) {
        debug!(id = %id, reason = %reason, "item skipped");
        self.summary.skipped.push(SkippedItem { id, reason });
    }

    fn stop(&mut self, reason: String) {
        if self.summary.stopped_early {
            return;
        }
        self.summary.stopped_early = true;
        self.progress.report(FetchProgressEvent::Stopped {
            source: self.summary.source,
            reason: reason.clone(),
        });
        self.warn(reason);
    }

    /// Consult the limiter; a refusal stops the batch.
    async fn admit(&mut self, key: &RateLimitKey) -> bool {
        match self.limiter.check(key).await {
            Ok(true) => true,
            Ok(false) => {
                self.stop(format!(
                    "stopped early: safety limit reached for {}",
                    key.endpoint
                ));
                false
            }
            Err(e) => {
                self.stop(format!(
                    "stopped early: rate limit state unavailable for {}: {:#}",
                    key.endpoint, e
                ));
                false
            }
        }
    }

    /// Classify a source call's result, recording the request on success.
    async fn settle<T>(
        &mut self,
        key: &RateLimitKey,
        what: &str,
        result: Result<T, FetchError>,
    ) -> Result<Step<T>> {
        match result {
            Ok(value) => {
                if let Err(e) = self.limiter.record(key).await {
                    self.warn(format!("failed to record request for {}: {:#}", key, e));
                }
                Ok(Step::Proceed(value))
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(FetchError::RateLimitExceeded { endpoint }) => {
                self.stop(format!("stopped early: remote rate limit on {}", endpoint));
                Ok(Step::Stop)
            }
            Err(e) => {
                self.warn(format!("{} failed: {}", what, e));
                Ok(Step::Skip)
            }
        }
    }

    /// Gate, perform and settle one source call.
    async fn guarded<T, F, Fut>(&mut self, key: &RateLimitKey, what: &str, call: F) -> Result<Step<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if !self.admit(key).await {
            return Ok(Step::Stop);
        }
        let result = call().await;
        self.settle(key, what, result).await
    }

    /// Persist one native record: raw payload first, then the normalized
    /// message with its author and channel. Returns whether it was stored.
    async fn store(&mut self, record: NativeRecord) -> bool {
        let id = record.message_id();
        match record.raw_payload() {
            Ok(raw) => {
                if let Err(e) = self.store.save_raw_payload(&raw).await {
                    self.warn(format!("raw payload for {} not saved: {:#}", id, e));
                }
            }
            Err(e) => self.warn(format!("raw payload for {} not encoded: {}", id, e)),
        }

        let normalized = match normalize(&record) {
            Ok(n) => n,
            Err(e) => {
                self.skip(id, FetchError::from(e).to_string());
                return false;
            }
        };
        if let Some(user) = &normalized.author {
            if let Err(e) = self.store.save_user(user).await {
                self.warn(format!("user {} not saved: {:#}", user.id, e));
            }
        }
        if let Some(channel) = &normalized.channel {
            if let Err(e) = self.store.save_channel(channel).await {
                self.warn(format!("channel {} not saved: {:#}", channel.id, e));
            }
        }
        match self.store.save_message(&normalized.message).await {
            Ok(()) => {
                self.summary.messages_stored += 1;
                true
            }
            Err(e) => {
                self.skip(id, FetchError::persistence(e).to_string());
                false
            }
        }
    }

    fn finish(self) -> FetchSummary {
        info!(
            source = %self.summary.source,
            stored = self.summary.messages_stored,
            threads = self.summary.threads_processed,
            skipped = self.summary.skipped.len(),
            stopped_early = self.summary.stopped_early,
            "fetch finished"
        );
        self.summary
    }
}

/// Thread timestamp to complete for a search match, if any.
fn thread_of(m: &SlackMessage) -> Option<String> {
    m.resolve_thread_ts()
        .or_else(|| m.reply_count.filter(|c| *c > 0).map(|_| m.ts.clone()))
}

/// Search a chat source and store every match, completing threads when
/// `filter.fetch_threads` is set.
///
/// A thread that cannot be fetched falls back to storing the match alone.
pub async fn fetch_slack<S>(
    source: &S,
    filter: &SlackFetchFilter,
    ctx: &FetchContext<'_>,
) -> Result<FetchSummary>
where
    S: SlackSource + ?Sized,
{
    let query = filter.build_query()?;
    let identity = source.identity().await?;
    let team_id = identity.team_id.clone();
    let workspace = Some(slack_workspace_id(&team_id));
    let search_key = RateLimitKey::new(SourceType::Slack, workspace.clone(), endpoints::SLACK_SEARCH);
    let replies_key = RateLimitKey::new(SourceType::Slack, workspace, endpoints::SLACK_REPLIES);

    let mut run = Run::new(ctx, SourceType::Slack, query.clone());
    run.limiter.init(&search_key).await?;
    run.limiter.init(&replies_key).await?;

    ctx.progress.report(FetchProgressEvent::Searching {
        source: SourceType::Slack,
        query: query.clone(),
    });
    let matches = match run
        .guarded(&search_key, "search", || source.search_messages(&query, filter.limit))
        .await?
    {
        Step::Proceed(matches) => matches,
        Step::Skip | Step::Stop => return Ok(run.finish()),
    };
    let total = matches.len();
    ctx.progress.report(FetchProgressEvent::Found {
        source: SourceType::Slack,
        count: total,
    });

    let record = |channel: &SlackChannelRef, message: SlackMessage| NativeRecord::SlackMessage {
        team_id: team_id.clone(),
        channel: channel.clone(),
        message,
    };

    // Reply timestamps stored per completed (channel, thread_ts).
    let mut fetched_threads: HashMap<(String, String), HashSet<String>> = HashMap::new();
    for (i, m) in matches.into_iter().enumerate() {
        ctx.progress.report(FetchProgressEvent::Processing {
            source: SourceType::Slack,
            n: i + 1,
            total,
        });
        let Some(channel) = m.channel.clone() else {
            run.skip(format!("slack:{}", m.ts), "search match has no channel".into());
            continue;
        };
        let thread_ts = if filter.fetch_threads { thread_of(&m) } else { None };
        let Some(thread_ts) = thread_ts else {
            run.store(record(&channel, m)).await;
            continue;
        };
        let thread_key = (channel.id.clone(), thread_ts.clone());
        if let Some(stored) = fetched_threads.get_mut(&thread_key) {
            if stored.insert(m.ts.clone()) {
                run.store(record(&channel, m)).await;
            }
            continue;
        }

        let replies = run
            .guarded(&replies_key, "thread replies", || {
                source.thread_replies(&channel.id, &thread_ts)
            })
            .await?;
        match replies {
            Step::Proceed(replies) => {
                run.summary.threads_processed += 1;
                let mut stored: HashSet<String> = replies.iter().map(|r| r.ts.clone()).collect();
                for reply in replies {
                    run.store(record(&channel, reply)).await;
                }
                if stored.insert(m.ts.clone()) {
                    run.store(record(&channel, m)).await;
                }
                fetched_threads.insert(thread_key, stored);
            }
            Step::Skip => {
                run.store(record(&channel, m)).await;
            }
            Step::Stop => {
                run.store(record(&channel, m)).await;
                break;
            }
        }
    }

    Ok(run.finish())
}

/// Search an issue/PR source and store every matched thread with its
/// comments, reviews, review comments and significant timeline events,
/// then (optionally) discussions with their comments.
pub async fn fetch_github<S>(
    source: &S,
    filter: &GitHubFetchFilter,
    ctx: &FetchContext<'_>,
) -> Result<FetchSummary>
where
    S: GitHubSource + ?Sized,
{
    let query = filter.build_issue_query()?;
    let login = source.viewer().await?;
    debug!(login = %login, "authenticated");

    let workspace = Some(github_workspace_id(&filter.owner));
    let key = |endpoint: &str| RateLimitKey::new(SourceType::GitHub, workspace.clone(), endpoint);
    let search_key = key(endpoints::GITHUB_SEARCH);
    let rest_key = key(endpoints::GITHUB_REST);
    let graphql_key = key(endpoints::GITHUB_GRAPHQL);

    let mut run = Run::new(ctx, SourceType::GitHub, query.clone());
    for k in [&search_key, &rest_key, &graphql_key] {
        run.limiter.init(k).await?;
    }

    ctx.progress.report(FetchProgressEvent::Searching {
        source: SourceType::GitHub,
        query: query.clone(),
    });
    let issues = match run
        .guarded(&search_key, "issue search", || source.search_issues(&query, filter.limit))
        .await?
    {
        Step::Proceed(issues) => issues,
        Step::Skip => Vec::new(),
        Step::Stop => return Ok(run.finish()),
    };
    let total = issues.len();
    ctx.progress.report(FetchProgressEvent::Found {
        source: SourceType::GitHub,
        count: total,
    });

    'issues: for (i, issue) in issues.into_iter().enumerate() {
        ctx.progress.report(FetchProgressEvent::Processing {
            source: SourceType::GitHub,
            n: i + 1,
            total,
        });
        let Some(repo) = filter.repo_ref().or_else(|| issue.repository()) else {
            run.skip(
                format!("{}#{}", filter.owner, issue.number),
                "search result has no repository".into(),
            );
            continue;
        };
        let anchor = ThreadAnchor::for_issue(repo.clone(), &issue);
        run.store(NativeRecord::Issue { repo, issue }).await;
        run.summary.threads_processed += 1;

        match run
            .guarded(&rest_key, "comments", || source.comments(&anchor))
            .await?
        {
            Step::Proceed(comments) => {
                for comment in comments {
                    let anchor = anchor.clone();
                    run.store(NativeRecord::IssueComment { anchor, comment }).await;
                }
            }
            Step::Skip => {}
            Step::Stop => break 'issues,
        }

        if anchor.kind == ThreadKind::PullRequest {
            match run
                .guarded(&rest_key, "reviews", || source.reviews(&anchor))
                .await?
            {
                Step::Proceed(reviews) => {
                    for review in reviews {
                        if review.body.as_deref().map_or(true, |b| b.trim().is_empty()) {
                            continue;
                        }
                        let anchor = anchor.clone();
                        run.store(NativeRecord::Review { anchor, review }).await;
                    }
                }
                Step::Skip => {}
                Step::Stop => break 'issues,
            }

            match run
                .guarded(&rest_key, "review comments", || source.review_comments(&anchor))
                .await?
            {
                Step::Proceed(comments) => {
                    for comment in comments {
                        let anchor = anchor.clone();
                        run.store(NativeRecord::ReviewComment { anchor, comment }).await;
                    }
                }
                Step::Skip => {}
                Step::Stop => break 'issues,
            }
        }

        match run
            .guarded(&rest_key, "timeline", || source.timeline(&anchor))
            .await?
        {
            Step::Proceed(events) => {
                for event in events.into_iter().filter(|e| e.is_significant()) {
                    let anchor = anchor.clone();
                    run.store(NativeRecord::TimelineEvent { anchor, event }).await;
                }
            }
            Step::Skip => {}
            Step::Stop => break 'issues,
        }
    }

    if filter.include_discussions && !run.summary.stopped_early {
        fetch_discussions(source, filter, &graphql_key, &mut run).await?;
    }

    Ok(run.finish())
}

async fn fetch_discussions<S>(
    source: &S,
    filter: &GitHubFetchFilter,
    key: &RateLimitKey,
    run: &mut Run<'_>,
) -> Result<()>
where
    S: GitHubSource + ?Sized,
{
    let query = filter.build_discussion_query()?;
    let discussions = match run
        .guarded(key, "discussion search", || source.search_discussions(&query, filter.limit))
        .await?
    {
        Step::Proceed(d) => d,
        Step::Skip | Step::Stop => return Ok(()),
    };

    for discussion in discussions {
        let Some(repo) = filter.repo_ref().or_else(|| discussion.repository()) else {
            run.skip(
                format!("{}/discussions/{}", filter.owner, discussion.number),
                "discussion has no repository".into(),
            );
            continue;
        };
        let anchor = ThreadAnchor::for_discussion(repo.clone(), &discussion);
        run.store(NativeRecord::Discussion { repo, discussion }).await;
        run.summary.threads_processed += 1;

        match run
            .guarded(key, "discussion comments", || source.discussion_comments(&anchor))
            .await?
        {
            Step::Proceed(comments) => {
                for comment in comments {
                    let anchor = anchor.clone();
                    run.store(NativeRecord::DiscussionComment { anchor, comment })
                        .await;
                }
            }
            Step::Skip => {}
            Step::Stop => break,
        }
    }
    Ok(())
}
