//! `loom fetch slack|github`: run one fetch against the SQLite store.
//!
//! Builds the filter from CLI arguments, opens the database, wraps the
//! source client in the snapshot cache when `[cache] enabled`, and prints
//! the [`FetchSummary`] as pretty JSON on stdout.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Args, ValueEnum};

use threadloom_core::fetch::{
    fetch_github, fetch_slack, parse_date_spec, FetchContext, FetchSummary, GitHubFetchFilter,
    IssueKind, SlackFetchFilter, DEFAULT_LIMIT,
};
use threadloom_core::source::{GitHubSource, SlackSource};

use crate::cache::{CachedGitHub, CachedSlack, SnapshotCache};
use crate::config::Config;
use crate::connector_github::GitHubClient;
use crate::connector_slack::SlackClient;
use crate::db;
use crate::progress::ProgressMode;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Args)]
pub struct SlackArgs {
    /// Messages from this user (`alice` or `@alice`).
    #[arg(long)]
    pub user: Option<String>,

    /// Channel name (`general`, `#general`) or id (`C0123ABC`).
    #[arg(long)]
    pub channel: Option<String>,

    /// Free-text search terms.
    #[arg(long)]
    pub search: Option<String>,

    /// Earliest day: `7d`, `2w` or `YYYY-MM-DD`.
    #[arg(long)]
    pub since: Option<String>,

    /// Latest day: `7d`, `2w` or `YYYY-MM-DD`.
    #[arg(long)]
    pub until: Option<String>,

    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// Store search matches only; skip thread completion.
    #[arg(long)]
    pub no_threads: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    All,
    Issue,
    Pr,
}

#[derive(Debug, Args)]
pub struct GitHubArgs {
    /// User or organization that owns the repositories.
    #[arg(long)]
    pub owner: String,

    /// Restrict to one repository; org-wide otherwise.
    #[arg(long)]
    pub repo: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    #[arg(long)]
    pub commenter: Option<String>,

    #[arg(long)]
    pub label: Option<String>,

    #[arg(long)]
    pub search: Option<String>,

    /// Updated on or after: `7d`, `2w` or `YYYY-MM-DD`.
    #[arg(long)]
    pub since: Option<String>,

    #[arg(long, value_enum, default_value = "all")]
    pub kind: KindArg,

    #[arg(long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,

    /// Also fetch discussions and their comment trees.
    #[arg(long)]
    pub discussions: bool,
}

fn date_arg(spec: Option<&str>, today: NaiveDate) -> Result<Option<NaiveDate>> {
    spec.map(|s| parse_date_spec(s, today)).transpose()
}

impl SlackArgs {
    pub fn to_filter(&self, today: NaiveDate) -> Result<SlackFetchFilter> {
        Ok(SlackFetchFilter {
            user: self.user.clone(),
            channel: self.channel.clone(),
            search: self.search.clone(),
            since: date_arg(self.since.as_deref(), today)?,
            until: date_arg(self.until.as_deref(), today)?,
            limit: self.limit,
            fetch_threads: !self.no_threads,
        })
    }
}

impl GitHubArgs {
    pub fn to_filter(&self, today: NaiveDate) -> Result<GitHubFetchFilter> {
        Ok(GitHubFetchFilter {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            author: self.author.clone(),
            commenter: self.commenter.clone(),
            label: self.label.clone(),
            search: self.search.clone(),
            since: date_arg(self.since.as_deref(), today)?,
            kind: match self.kind {
                KindArg::All => IssueKind::All,
                KindArg::Issue => IssueKind::Issues,
                KindArg::Pr => IssueKind::PullRequests,
            },
            limit: self.limit,
            include_discussions: self.discussions,
        })
    }
}

fn print_summary(summary: &FetchSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

pub async fn run_fetch_slack(config: &Config, args: &SlackArgs, progress: ProgressMode) -> Result<()> {
    let filter = args.to_filter(Utc::now().date_naive())?;
    // Validate before touching the network or the database.
    filter.build_query()?;

    let client = SlackClient::from_config(config)?;
    let source: Box<dyn SlackSource> = match SnapshotCache::from_config(&config.cache) {
        Some(cache) => Box::new(CachedSlack::new(client, cache)),
        None => Box::new(client),
    };

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let policies = config.rate_limit_policies();
    let reporter = progress.reporter();
    let ctx = FetchContext {
        store: &store,
        rate_limits: &store,
        policies: &policies,
        progress: reporter.as_ref(),
    };

    let result = fetch_slack(source.as_ref(), &filter, &ctx).await;
    pool.close().await;
    print_summary(&result?)
}

pub async fn run_fetch_github(config: &Config, args: &GitHubArgs, progress: ProgressMode) -> Result<()> {
    let filter = args.to_filter(Utc::now().date_naive())?;
    filter.build_issue_query()?;

    let client = GitHubClient::from_config(config)?;
    let source: Box<dyn GitHubSource> = match SnapshotCache::from_config(&config.cache) {
        Some(cache) => Box::new(CachedGitHub::new(client, cache)),
        None => Box::new(client),
    };

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let policies = config.rate_limit_policies();
    let reporter = progress.reporter();
    let ctx = FetchContext {
        store: &store,
        rate_limits: &store,
        policies: &policies,
        progress: reporter.as_ref(),
    };

    let result = fetch_github(source.as_ref(), &filter, &ctx).await;
    pool.close().await;
    print_summary(&result?)
}
