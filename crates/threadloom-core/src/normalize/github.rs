//! Issue/PR-source records and their normalization.
//!
//! Every issue, pull request and discussion is a thread root. Comments,
//! reviews, review comments and timeline events are direct children of the
//! root, even when they reply to each other natively (the native reply
//! target is kept in `source_metadata`). Discussion replies are the one
//! exception: they keep their real parent comment.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NormalizeError;
use crate::extract::normalize_markdown;
use crate::models::{CanonicalMessage, Channel, NormalizedRecord, SourceType, User};

use super::{github_workspace_id, populate_entities};

const GHOST_LOGIN: &str = "ghost";

/// `owner/name` of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    /// Parse the trailing `/repos/{owner}/{name}` of an API URL.
    pub fn from_api_url(url: &str) -> Option<Self> {
        let (_, tail) = url.split_once("/repos/")?;
        Self::parse(tail.trim_end_matches('/'))
    }

    pub fn channel_id(&self) -> String {
        format!("chan_github_{}_{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    #[serde(default, alias = "avatarUrl")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// Issue or pull request, as returned by the search and issues APIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub user: Option<GitHubUser>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignees: Vec<GitHubUser>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub closed_at: Option<String>,
    /// Set on pull-request payloads; search results carry it under
    /// `pull_request` instead.
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub comments: Option<u64>,
    /// Present (with links) only on pull requests.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.as_ref().is_some_and(|v| !v.is_null())
    }

    pub fn merged_at(&self) -> Option<&str> {
        self.merged_at.as_deref().or_else(|| {
            self.pull_request
                .as_ref()
                .and_then(|pr| pr.get("merged_at"))
                .and_then(Value::as_str)
        })
    }

    pub fn repository(&self) -> Option<RepoRef> {
        self.repository_url.as_deref().and_then(RepoRef::from_api_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GitHubUser>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GitHubUser>,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub commit_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GitHubUser>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub original_line: Option<u64>,
    pub created_at: String,
    #[serde(default)]
    pub in_reply_to_id: Option<u64>,
    #[serde(default)]
    pub pull_request_review_id: Option<u64>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// One entry of an issue's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub node_id: Option<String>,
    pub event: String,
    #[serde(default)]
    pub actor: Option<GitHubUser>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub label: Option<Label>,
    #[serde(default)]
    pub assignee: Option<GitHubUser>,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub rename: Option<Rename>,
}

impl TimelineEvent {
    /// Events that change an issue's state or meaning; comments and
    /// reviews are fetched through their own endpoints.
    pub const SIGNIFICANT: &'static [&'static str] = &[
        "closed",
        "reopened",
        "merged",
        "labeled",
        "unlabeled",
        "assigned",
        "unassigned",
        "referenced",
        "cross-referenced",
        "renamed",
        "review_requested",
        "locked",
        "unlocked",
        "milestoned",
    ];

    pub fn is_significant(&self) -> bool {
        Self::SIGNIFICANT.contains(&self.event.as_str())
    }

    /// Stable per-issue key: numeric id, node id, or event name and time.
    pub fn native_key(&self) -> String {
        if let Some(id) = self.id {
            return id.to_string();
        }
        if let Some(node) = self.node_id.as_deref().filter(|n| !n.is_empty()) {
            return node.to_string();
        }
        let when = self
            .created_at
            .as_deref()
            .and_then(|t| parse_time(t).ok())
            .map(|t| t.timestamp().to_string())
            .unwrap_or_else(|| "0".to_string());
        format!("{}_{}", self.event, when)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionCategory {
    pub name: String,
}

/// Repository reference as embedded in GraphQL results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryName {
    pub name_with_owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discussion {
    /// GraphQL node id.
    pub id: String,
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: Option<GitHubUser>,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub category: Option<DiscussionCategory>,
    #[serde(default)]
    pub repository: Option<RepositoryName>,
}

impl Discussion {
    pub fn repository(&self) -> Option<RepoRef> {
        self.repository
            .as_ref()
            .and_then(|r| RepoRef::parse(&r.name_with_owner))
    }
}

/// A discussion comment or a reply to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionComment {
    /// GraphQL node id.
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: Option<GitHubUser>,
    pub created_at: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_answer: bool,
    /// Node id of the comment this one replies to; `None` for top-level.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Kind of thread root a child record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadKind {
    Issue,
    #[serde(rename = "pr")]
    PullRequest,
    Discussion,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadKind::Issue => "issue",
            ThreadKind::PullRequest => "pr",
            ThreadKind::Discussion => "discussion",
        }
    }
}

/// The thread root a child record is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadAnchor {
    pub repo: RepoRef,
    pub kind: ThreadKind,
    pub number: u64,
    /// Last modification time of the root, when known.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ThreadAnchor {
    pub fn for_issue(repo: RepoRef, issue: &Issue) -> Self {
        let kind = if issue.is_pull_request() {
            ThreadKind::PullRequest
        } else {
            ThreadKind::Issue
        };
        Self {
            repo,
            kind,
            number: issue.number,
            updated_at: issue.updated_at.as_deref().and_then(|t| parse_time(t).ok()),
        }
    }

    pub fn for_discussion(repo: RepoRef, discussion: &Discussion) -> Self {
        Self {
            repo,
            kind: ThreadKind::Discussion,
            number: discussion.number,
            updated_at: discussion
                .updated_at
                .as_deref()
                .and_then(|t| parse_time(t).ok()),
        }
    }

    pub fn root_id(&self) -> String {
        format!(
            "msg_github_{}_{}_{}_{}",
            self.repo.owner,
            self.repo.name,
            self.kind.as_str(),
            self.number
        )
    }

    pub fn child_id(&self, sub_kind: &str, native: &str) -> String {
        format!("{}_{}_{}", self.root_id(), sub_kind, native)
    }

    /// Human-readable locator, e.g. `octo/app#12` or `octo/app/discussions/3`.
    pub fn locator(&self) -> String {
        match self.kind {
            ThreadKind::Discussion => format!("{}/discussions/{}", self.repo, self.number),
            _ => format!("{}#{}", self.repo, self.number),
        }
    }
}

pub fn user_id(login: &str) -> String {
    format!("user_github_{}", login)
}

/// Parse an RFC 3339 timestamp as returned by the REST and GraphQL APIs.
pub fn parse_time(value: &str) -> Result<DateTime<Utc>, NormalizeError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| NormalizeError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn login_of(user: Option<&GitHubUser>) -> &str {
    user.map(|u| u.login.as_str())
        .filter(|l| !l.is_empty())
        .unwrap_or(GHOST_LOGIN)
}

fn author_record(user: Option<&GitHubUser>) -> User {
    let login = login_of(user);
    User {
        id: user_id(login),
        source_type: SourceType::GitHub,
        source_id: login.to_string(),
        display_name: Some(login.to_string()),
        real_name: user.and_then(|u| u.name.clone()),
        email: None,
        avatar_url: user.and_then(|u| u.avatar_url.clone()),
    }
}

fn repo_channel(repo: &RepoRef) -> Channel {
    Channel {
        id: repo.channel_id(),
        source_type: SourceType::GitHub,
        source_id: repo.to_string(),
        workspace_id: Some(github_workspace_id(&repo.owner)),
        name: repo.name.clone(),
        display_name: repo.to_string(),
        kind: "repository".to_string(),
        is_private: false,
    }
}

/// Shared shape of every GitHub message before entity extraction.
struct Draft<'a> {
    id: String,
    source_id: String,
    repo: &'a RepoRef,
    thread_id: String,
    parent_id: Option<String>,
    created_at: &'a str,
    user: Option<&'a GitHubUser>,
    content: String,
    metadata: Map<String, Value>,
}

impl Draft<'_> {
    fn finish(self) -> Result<NormalizedRecord, NormalizeError> {
        let timestamp = parse_time(self.created_at)?;
        let author = author_record(self.user);
        let is_root = self.parent_id.is_none();
        let mut message = CanonicalMessage {
            id: self.id,
            source_type: SourceType::GitHub,
            source_id: self.source_id,
            timestamp,
            author_id: author.id.clone(),
            content: normalize_markdown(&self.content),
            channel_id: self.repo.channel_id(),
            thread_id: self.thread_id,
            parent_id: self.parent_id,
            is_thread_root: is_root,
            mentions: Default::default(),
            urls: Vec::new(),
            code_blocks: Vec::new(),
            source_metadata: self.metadata,
        };
        populate_entities(&mut message);
        Ok(NormalizedRecord {
            message,
            author: Some(author),
            channel: Some(repo_channel(self.repo)),
        })
    }
}

fn title_and_body(title: &str, body: &str) -> String {
    if body.trim().is_empty() {
        title.to_string()
    } else {
        format!("{}\n\n{}", title, body)
    }
}

fn text(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

pub(crate) fn normalize_issue(
    repo: &RepoRef,
    issue: &Issue,
) -> Result<NormalizedRecord, NormalizeError> {
    let anchor = ThreadAnchor::for_issue(repo.clone(), issue);
    let root = anchor.root_id();

    let mut metadata = Map::new();
    metadata.insert("kind".into(), Value::String(anchor.kind.as_str().into()));
    metadata.insert("number".into(), Value::from(issue.number));
    metadata.insert("title".into(), Value::String(issue.title.clone()));
    metadata.insert("state".into(), Value::String(issue.state.clone()));
    metadata.insert(
        "labels".into(),
        Value::from(issue.labels.iter().map(|l| l.name.clone()).collect::<Vec<_>>()),
    );
    metadata.insert(
        "assignees".into(),
        Value::from(
            issue
                .assignees
                .iter()
                .map(|a| a.login.clone())
                .collect::<Vec<_>>(),
        ),
    );
    metadata.insert("url".into(), opt_string(&issue.html_url));
    metadata.insert("closed_at".into(), opt_string(&issue.closed_at));
    if anchor.kind == ThreadKind::PullRequest {
        metadata.insert(
            "merged_at".into(),
            issue.merged_at().map_or(Value::Null, |t| Value::String(t.into())),
        );
    }

    Draft {
        id: root.clone(),
        source_id: anchor.locator(),
        repo,
        thread_id: root,
        parent_id: None,
        created_at: &issue.created_at,
        user: issue.user.as_ref(),
        content: title_and_body(&issue.title, text(&issue.body)),
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_comment(
    anchor: &ThreadAnchor,
    comment: &Comment,
) -> Result<NormalizedRecord, NormalizeError> {
    let root = anchor.root_id();
    let mut metadata = Map::new();
    metadata.insert("url".into(), opt_string(&comment.html_url));

    Draft {
        id: anchor.child_id("comment", &comment.id.to_string()),
        source_id: format!("{}/comment/{}", anchor.locator(), comment.id),
        repo: &anchor.repo,
        thread_id: root.clone(),
        parent_id: Some(root),
        created_at: &comment.created_at,
        user: comment.user.as_ref(),
        content: text(&comment.body).to_string(),
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_review(
    anchor: &ThreadAnchor,
    review: &Review,
) -> Result<NormalizedRecord, NormalizeError> {
    let root = anchor.root_id();
    let created_at = review
        .submitted_at
        .as_deref()
        .ok_or(NormalizeError::MissingField("submitted_at"))?;
    let body = text(&review.body).trim();
    let content = if body.is_empty() {
        format!("[{}]", review.state)
    } else {
        format!("[{}] {}", review.state, body)
    };

    let mut metadata = Map::new();
    metadata.insert("review_state".into(), Value::String(review.state.clone()));
    metadata.insert("commit_id".into(), opt_string(&review.commit_id));
    metadata.insert("url".into(), opt_string(&review.html_url));

    Draft {
        id: anchor.child_id("review", &review.id.to_string()),
        source_id: format!("{}/review/{}", anchor.locator(), review.id),
        repo: &anchor.repo,
        thread_id: root.clone(),
        parent_id: Some(root),
        created_at,
        user: review.user.as_ref(),
        content,
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_review_comment(
    anchor: &ThreadAnchor,
    comment: &ReviewComment,
) -> Result<NormalizedRecord, NormalizeError> {
    let root = anchor.root_id();
    let location = match (&comment.path, comment.line.or(comment.original_line)) {
        (Some(path), Some(line)) => format!("[{}:{}] ", path, line),
        (Some(path), None) => format!("[{}] ", path),
        _ => String::new(),
    };

    let mut metadata = Map::new();
    metadata.insert("path".into(), opt_string(&comment.path));
    if let Some(line) = comment.line.or(comment.original_line) {
        metadata.insert("line".into(), Value::from(line));
    }
    if let Some(review_id) = comment.pull_request_review_id {
        metadata.insert("review_id".into(), Value::from(review_id));
    }
    if let Some(reply_to) = comment.in_reply_to_id {
        metadata.insert(
            "in_reply_to".into(),
            Value::String(anchor.child_id("review_comment", &reply_to.to_string())),
        );
    }
    metadata.insert("url".into(), opt_string(&comment.html_url));

    Draft {
        id: anchor.child_id("review_comment", &comment.id.to_string()),
        source_id: format!("{}/review_comment/{}", anchor.locator(), comment.id),
        repo: &anchor.repo,
        thread_id: root.clone(),
        parent_id: Some(root),
        created_at: &comment.created_at,
        user: comment.user.as_ref(),
        content: format!("{}{}", location, text(&comment.body)),
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_timeline_event(
    anchor: &ThreadAnchor,
    event: &TimelineEvent,
) -> Result<NormalizedRecord, NormalizeError> {
    let root = anchor.root_id();
    let created_at = event
        .created_at
        .as_deref()
        .ok_or(NormalizeError::MissingField("created_at"))?;

    let detail = if let Some(body) = event.body.as_deref().filter(|b| !b.trim().is_empty()) {
        body.to_string()
    } else if let Some(label) = &event.label {
        format!("Label: {}", label.name)
    } else if let Some(assignee) = &event.assignee {
        format!("Assignee: {}", assignee.login)
    } else if let Some(rename) = &event.rename {
        format!("Title: {} -> {}", rename.from, rename.to)
    } else if let Some(commit) = event.commit_id.as_deref().filter(|c| !c.is_empty()) {
        format!("Commit: {}", commit.chars().take(7).collect::<String>())
    } else {
        format!("Issue {}", event.event)
    };

    let mut metadata = Map::new();
    metadata.insert("event".into(), Value::String(event.event.clone()));
    metadata.insert("commit_id".into(), opt_string(&event.commit_id));

    let key = event.native_key();
    Draft {
        id: anchor.child_id("event", &key),
        source_id: format!("{}/event/{}", anchor.locator(), key),
        repo: &anchor.repo,
        thread_id: root.clone(),
        parent_id: Some(root),
        created_at,
        user: event.actor.as_ref(),
        content: format!("[{}] {}", event.event, detail),
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_discussion(
    repo: &RepoRef,
    discussion: &Discussion,
) -> Result<NormalizedRecord, NormalizeError> {
    let anchor = ThreadAnchor::for_discussion(repo.clone(), discussion);
    let root = anchor.root_id();
    let category = discussion.category.as_ref().map(|c| c.name.clone());
    let body = title_and_body(&discussion.title, &discussion.body);
    let content = match &category {
        Some(name) if !name.is_empty() => format!("[{}] {}", name, body),
        _ => body,
    };

    let mut metadata = Map::new();
    metadata.insert("kind".into(), Value::String("discussion".into()));
    metadata.insert("number".into(), Value::from(discussion.number));
    metadata.insert("title".into(), Value::String(discussion.title.clone()));
    metadata.insert("category".into(), opt_string(&category));
    metadata.insert("url".into(), opt_string(&discussion.url));

    Draft {
        id: root.clone(),
        source_id: anchor.locator(),
        repo,
        thread_id: root,
        parent_id: None,
        created_at: &discussion.created_at,
        user: discussion.author.as_ref(),
        content,
        metadata,
    }
    .finish()
}

pub(crate) fn normalize_discussion_comment(
    anchor: &ThreadAnchor,
    comment: &DiscussionComment,
) -> Result<NormalizedRecord, NormalizeError> {
    let root = anchor.root_id();
    let parent = match comment.reply_to.as_deref() {
        Some(reply_to) => anchor.child_id("comment", reply_to),
        None => root.clone(),
    };

    let mut metadata = Map::new();
    metadata.insert("is_answer".into(), Value::Bool(comment.is_answer));
    metadata.insert("url".into(), opt_string(&comment.url));

    Draft {
        id: anchor.child_id("comment", &comment.id),
        source_id: format!("{}/comment/{}", anchor.locator(), comment.id),
        repo: &anchor.repo,
        thread_id: root,
        parent_id: Some(parent),
        created_at: &comment.created_at,
        user: comment.author.as_ref(),
        content: comment.body.clone(),
        metadata,
    }
    .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, NativeRecord};

    fn repo() -> RepoRef {
        RepoRef::new("octo", "app")
    }

    fn user(login: &str) -> GitHubUser {
        GitHubUser {
            login: login.into(),
            avatar_url: None,
            name: None,
        }
    }

    fn issue(number: u64, pr: bool) -> Issue {
        Issue {
            number,
            title: "Build fails on arm64".into(),
            body: Some("Linker error when running `cargo build --release`".into()),
            state: "open".into(),
            user: Some(user("alice")),
            labels: vec![Label { name: "bug".into() }],
            assignees: vec![],
            created_at: "2024-03-01T10:00:00Z".into(),
            updated_at: Some("2024-03-02T10:00:00Z".into()),
            closed_at: None,
            merged_at: None,
            html_url: Some("https://github.com/octo/app/issues/7".into()),
            repository_url: Some("https://api.github.com/repos/octo/app".into()),
            comments: Some(1),
            pull_request: if pr {
                Some(serde_json::json!({"url": "https://api.github.com/repos/octo/app/pulls/7"}))
            } else {
                None
            },
        }
    }

    fn anchor(kind: ThreadKind) -> ThreadAnchor {
        ThreadAnchor {
            repo: repo(),
            kind,
            number: 7,
            updated_at: None,
        }
    }

    #[test]
    fn test_repo_ref_parsing() {
        assert_eq!(RepoRef::parse("octo/app"), Some(repo()));
        assert_eq!(RepoRef::parse("octo"), None);
        assert_eq!(RepoRef::parse("a/b/c"), None);
        assert_eq!(
            RepoRef::from_api_url("https://api.github.com/repos/octo/app"),
            Some(repo())
        );
    }

    #[test]
    fn test_issue_is_root_with_title_and_body() {
        let out = normalize(&NativeRecord::Issue {
            repo: repo(),
            issue: issue(7, false),
        })
        .unwrap();
        let m = out.message;
        assert_eq!(m.id, "msg_github_octo_app_issue_7");
        assert!(m.is_thread_root);
        assert_eq!(m.thread_id, m.id);
        assert!(m.content.starts_with("Build fails on arm64\n\nLinker error"));
        assert_eq!(m.code_blocks.len(), 1);
        assert_eq!(m.author_id, "user_github_alice");
        assert_eq!(m.channel_id, "chan_github_octo_app");
        assert_eq!(m.source_metadata["state"], "open");
    }

    #[test]
    fn test_pull_request_detected_from_marker() {
        let rec = NativeRecord::Issue {
            repo: repo(),
            issue: issue(7, true),
        };
        assert_eq!(rec.message_id(), "msg_github_octo_app_pr_7");
        let out = normalize(&rec).unwrap();
        assert_eq!(out.message.source_metadata["kind"], "pr");
        assert!(out.message.source_metadata["merged_at"].is_null());

        let mut merged = issue(7, true);
        merged.merged_at = Some("2024-03-05T08:00:00Z".into());
        let out = normalize(&NativeRecord::Issue {
            repo: repo(),
            issue: merged,
        })
        .unwrap();
        assert_eq!(out.message.source_metadata["merged_at"], "2024-03-05T08:00:00Z");
    }

    #[test]
    fn test_comment_is_child_of_root() {
        let comment = Comment {
            id: 99,
            body: Some("Try `rustup update` first".into()),
            user: Some(user("bob")),
            created_at: "2024-03-01T11:00:00Z".into(),
            updated_at: None,
            html_url: None,
        };
        let out = normalize(&NativeRecord::IssueComment {
            anchor: anchor(ThreadKind::Issue),
            comment,
        })
        .unwrap();
        let m = out.message;
        assert_eq!(m.id, "msg_github_octo_app_issue_7_comment_99");
        assert_eq!(m.thread_id, "msg_github_octo_app_issue_7");
        assert_eq!(m.parent_id.as_deref(), Some("msg_github_octo_app_issue_7"));
        assert!(!m.is_thread_root);
    }

    #[test]
    fn test_review_content_carries_state() {
        let review = Review {
            id: 5,
            body: Some("Looks good".into()),
            user: Some(user("carol")),
            state: "APPROVED".into(),
            submitted_at: Some("2024-03-01T12:00:00Z".into()),
            html_url: None,
            commit_id: None,
        };
        let out = normalize(&NativeRecord::Review {
            anchor: anchor(ThreadKind::PullRequest),
            review,
        })
        .unwrap();
        assert_eq!(out.message.content, "[APPROVED] Looks good");
        assert_eq!(out.message.id, "msg_github_octo_app_pr_7_review_5");
    }

    #[test]
    fn test_review_comment_reply_is_flattened() {
        let comment = ReviewComment {
            id: 12,
            body: Some("Agreed".into()),
            user: Some(user("dave")),
            path: Some("src/lib.rs".into()),
            line: Some(42),
            original_line: None,
            created_at: "2024-03-01T13:00:00Z".into(),
            in_reply_to_id: Some(11),
            pull_request_review_id: Some(5),
            html_url: None,
        };
        let out = normalize(&NativeRecord::ReviewComment {
            anchor: anchor(ThreadKind::PullRequest),
            comment,
        })
        .unwrap();
        let m = out.message;
        assert_eq!(m.content, "[src/lib.rs:42] Agreed");
        assert_eq!(m.parent_id.as_deref(), Some("msg_github_octo_app_pr_7"));
        assert_eq!(m.thread_id, "msg_github_octo_app_pr_7");
        assert_eq!(
            m.source_metadata["in_reply_to"],
            "msg_github_octo_app_pr_7_review_comment_11"
        );
    }

    #[test]
    fn test_timeline_event_content() {
        let event = TimelineEvent {
            id: Some(1),
            node_id: None,
            event: "labeled".into(),
            actor: Some(user("erin")),
            created_at: Some("2024-03-01T14:00:00Z".into()),
            label: Some(Label { name: "bug".into() }),
            assignee: None,
            commit_id: None,
            body: None,
            rename: None,
        };
        assert!(event.is_significant());
        let out = normalize(&NativeRecord::TimelineEvent {
            anchor: anchor(ThreadKind::Issue),
            event,
        })
        .unwrap();
        assert_eq!(out.message.content, "[labeled] Label: bug");
    }

    #[test]
    fn test_merged_event_shortens_commit_by_character() {
        let event = TimelineEvent {
            id: Some(2),
            node_id: None,
            event: "merged".into(),
            actor: Some(user("erin")),
            created_at: Some("2024-03-01T15:00:00Z".into()),
            label: None,
            assignee: None,
            commit_id: Some("abcdefé0123".into()),
            body: None,
            rename: None,
        };
        let out = normalize(&NativeRecord::TimelineEvent {
            anchor: anchor(ThreadKind::PullRequest),
            event,
        })
        .unwrap();
        assert_eq!(out.message.content, "[merged] Commit: abcdefé");
    }

    #[test]
    fn test_timeline_event_without_id_has_stable_key() {
        let event = TimelineEvent {
            id: None,
            node_id: None,
            event: "cross-referenced".into(),
            actor: None,
            created_at: Some("2024-03-01T14:00:00Z".into()),
            label: None,
            assignee: None,
            commit_id: None,
            body: None,
            rename: None,
        };
        assert_eq!(event.native_key(), "cross-referenced_1709301600");
        let out = normalize(&NativeRecord::TimelineEvent {
            anchor: anchor(ThreadKind::Issue),
            event,
        })
        .unwrap();
        assert_eq!(out.message.author_id, "user_github_ghost");
    }

    #[test]
    fn test_discussion_replies_keep_nesting() {
        let a = anchor(ThreadKind::Discussion);
        let top = DiscussionComment {
            id: "DC_1".into(),
            body: "Have you tried clearing the cache?".into(),
            author: Some(user("bob")),
            created_at: "2024-03-01T11:00:00Z".into(),
            url: None,
            is_answer: true,
            reply_to: None,
        };
        let reply = DiscussionComment {
            id: "DC_2".into(),
            body: "That worked, thanks!".into(),
            author: Some(user("alice")),
            created_at: "2024-03-01T12:00:00Z".into(),
            url: None,
            is_answer: false,
            reply_to: Some("DC_1".into()),
        };
        let top = normalize(&NativeRecord::DiscussionComment {
            anchor: a.clone(),
            comment: top,
        })
        .unwrap()
        .message;
        let reply = normalize(&NativeRecord::DiscussionComment {
            anchor: a,
            comment: reply,
        })
        .unwrap()
        .message;
        assert_eq!(top.parent_id.as_deref(), Some("msg_github_octo_app_discussion_7"));
        assert_eq!(reply.parent_id.as_deref(), Some(top.id.as_str()));
        assert_eq!(reply.thread_id, top.thread_id);
        assert_eq!(top.source_metadata["is_answer"], true);
    }

    #[test]
    fn test_discussion_root_has_category() {
        let discussion = Discussion {
            id: "D_1".into(),
            number: 3,
            title: "How to deploy?".into(),
            body: "Looking for guidance".into(),
            author: Some(user("alice")),
            created_at: "2024-03-01T10:00:00Z".into(),
            updated_at: None,
            url: None,
            category: Some(DiscussionCategory { name: "Q&A".into() }),
            repository: Some(RepositoryName {
                name_with_owner: "octo/app".into(),
            }),
        };
        assert_eq!(discussion.repository(), Some(repo()));
        let out = normalize(&NativeRecord::Discussion {
            repo: repo(),
            discussion,
        })
        .unwrap();
        assert_eq!(out.message.id, "msg_github_octo_app_discussion_3");
        assert_eq!(out.message.content, "[Q&A] How to deploy?\n\nLooking for guidance");
    }

    #[test]
    fn test_bad_timestamp_is_error() {
        let mut i = issue(1, false);
        i.created_at = "yesterday".into();
        let err = normalize(&NativeRecord::Issue {
            repo: repo(),
            issue: i,
        })
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_issue_deserializes_from_api_json() {
        let json = serde_json::json!({
            "number": 3,
            "title": "t",
            "body": null,
            "state": "closed",
            "user": {"login": "zed", "avatar_url": "https://a/z.png"},
            "labels": [{"name": "question", "color": "fff"}],
            "created_at": "2024-01-01T00:00:00Z",
            "repository_url": "https://api.github.com/repos/octo/app",
            "pull_request": null
        });
        let issue: Issue = serde_json::from_value(json).unwrap();
        assert!(!issue.is_pull_request());
        assert_eq!(issue.repository(), Some(repo()));
    }
}
