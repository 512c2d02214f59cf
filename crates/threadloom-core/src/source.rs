//! Source client interfaces consumed by the fetch orchestrator.
//!
//! Clients decode responses straight into the native record types of
//! [`normalize`](crate::normalize) and classify failures into
//! [`FetchError`] variants; the orchestrator never sees transport details.

use async_trait::async_trait;

use crate::error::FetchError;
use crate::normalize::{
    Comment, Discussion, DiscussionComment, Issue, Review, ReviewComment, SlackMessage,
    ThreadAnchor, TimelineEvent,
};

/// Workspace the chat token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackIdentity {
    pub team_id: String,
    pub team_name: Option<String>,
    pub user_id: Option<String>,
}

/// Chat-style source: message search plus thread completion.
#[async_trait]
pub trait SlackSource: Send + Sync {
    /// Resolve the workspace for the configured credentials.
    async fn identity(&self) -> Result<SlackIdentity, FetchError>;

    /// Search messages, newest first, returning at most `limit` matches.
    async fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SlackMessage>, FetchError>;

    /// Every message of the thread rooted at `thread_ts`, root included.
    async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, FetchError>;
}

/// Issue/PR-style source.
///
/// Issues and pull requests both come from [`search_issues`](Self::search_issues)
/// (the query selects `is:issue` or `is:pr`); the remaining calls fetch one
/// thread's children.
#[async_trait]
pub trait GitHubSource: Send + Sync {
    /// Login of the authenticated user; fails on missing or bad credentials.
    async fn viewer(&self) -> Result<String, FetchError>;

    async fn search_issues(&self, query: &str, limit: usize) -> Result<Vec<Issue>, FetchError>;

    async fn comments(&self, anchor: &ThreadAnchor) -> Result<Vec<Comment>, FetchError>;

    async fn reviews(&self, anchor: &ThreadAnchor) -> Result<Vec<Review>, FetchError>;

    async fn review_comments(
        &self,
        anchor: &ThreadAnchor,
    ) -> Result<Vec<ReviewComment>, FetchError>;

    /// Timeline events; callers filter to the significant ones.
    async fn timeline(&self, anchor: &ThreadAnchor) -> Result<Vec<TimelineEvent>, FetchError>;

    async fn search_discussions(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Discussion>, FetchError>;

    /// Top-level comments followed by their replies, with `reply_to` set.
    async fn discussion_comments(
        &self,
        anchor: &ThreadAnchor,
    ) -> Result<Vec<DiscussionComment>, FetchError>;
}
