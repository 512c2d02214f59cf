//! Mapping of source-native records into the canonical schema.
//!
//! A [`NativeRecord`] is decided once, when the source client decodes a
//! response, and carries the context its normalizer needs (workspace,
//! channel, owning thread). [`normalize`] is then a pure function of that
//! record: the same input always yields the same ids and content.

pub mod github;
pub mod slack;

use crate::error::NormalizeError;
use crate::extract;
use crate::models::{CanonicalMessage, NormalizedRecord, RawPayload, SourceType};

pub use github::{
    Comment, Discussion, DiscussionComment, GitHubUser, Issue, RepoRef, Review, ReviewComment,
    ThreadAnchor, ThreadKind, TimelineEvent,
};
pub use slack::{SlackChannelRef, SlackMessage, SlackUserProfile};

/// One source-native record plus the context needed to normalize it.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeRecord {
    /// A chat message, either a search match or a reply fetched from its thread.
    SlackMessage {
        team_id: String,
        channel: SlackChannelRef,
        message: SlackMessage,
    },
    /// An issue or pull request; the variant is picked from the record itself.
    Issue { repo: RepoRef, issue: Issue },
    IssueComment {
        anchor: ThreadAnchor,
        comment: Comment,
    },
    Review { anchor: ThreadAnchor, review: Review },
    ReviewComment {
        anchor: ThreadAnchor,
        comment: ReviewComment,
    },
    TimelineEvent {
        anchor: ThreadAnchor,
        event: TimelineEvent,
    },
    Discussion {
        repo: RepoRef,
        discussion: Discussion,
    },
    DiscussionComment {
        anchor: ThreadAnchor,
        comment: DiscussionComment,
    },
}

impl NativeRecord {
    pub fn source_type(&self) -> SourceType {
        match self {
            NativeRecord::SlackMessage { .. } => SourceType::Slack,
            _ => SourceType::GitHub,
        }
    }

    /// Canonical id this record normalizes to.
    ///
    /// Available even when the record itself fails to normalize, so the raw
    /// payload can always be filed under a stable key.
    pub fn message_id(&self) -> String {
        match self {
            NativeRecord::SlackMessage {
                team_id,
                channel,
                message,
            } => slack::message_id(team_id, &channel.id, &message.ts),
            NativeRecord::Issue { repo, issue } => {
                ThreadAnchor::for_issue(repo.clone(), issue).root_id()
            }
            NativeRecord::IssueComment { anchor, comment } => {
                anchor.child_id("comment", &comment.id.to_string())
            }
            NativeRecord::Review { anchor, review } => {
                anchor.child_id("review", &review.id.to_string())
            }
            NativeRecord::ReviewComment { anchor, comment } => {
                anchor.child_id("review_comment", &comment.id.to_string())
            }
            NativeRecord::TimelineEvent { anchor, event } => {
                anchor.child_id("event", &event.native_key())
            }
            NativeRecord::Discussion { repo, discussion } => {
                ThreadAnchor::for_discussion(repo.clone(), discussion).root_id()
            }
            NativeRecord::DiscussionComment { anchor, comment } => {
                anchor.child_id("comment", &comment.id)
            }
        }
    }

    /// Identifier of the object inside its source.
    pub fn native_id(&self) -> String {
        match self {
            NativeRecord::SlackMessage {
                channel, message, ..
            } => format!("{}:{}", channel.id, message.ts),
            NativeRecord::Issue { repo, issue } => format!("{}#{}", repo, issue.number),
            NativeRecord::IssueComment { anchor, comment } => {
                format!("{}/comment/{}", anchor.locator(), comment.id)
            }
            NativeRecord::Review { anchor, review } => {
                format!("{}/review/{}", anchor.locator(), review.id)
            }
            NativeRecord::ReviewComment { anchor, comment } => {
                format!("{}/review_comment/{}", anchor.locator(), comment.id)
            }
            NativeRecord::TimelineEvent { anchor, event } => {
                format!("{}/event/{}", anchor.locator(), event.native_key())
            }
            NativeRecord::Discussion { repo, discussion } => {
                format!("{}/discussions/{}", repo, discussion.number)
            }
            NativeRecord::DiscussionComment { anchor, comment } => {
                format!("{}/comment/{}", anchor.locator(), comment.id)
            }
        }
    }

    /// Verbatim JSON of the native object, without the attached context.
    pub fn raw_payload(&self) -> Result<RawPayload, NormalizeError> {
        let blob = match self {
            NativeRecord::SlackMessage { message, .. } => serde_json::to_string(message)?,
            NativeRecord::Issue { issue, .. } => serde_json::to_string(issue)?,
            NativeRecord::IssueComment { comment, .. } => serde_json::to_string(comment)?,
            NativeRecord::Review { review, .. } => serde_json::to_string(review)?,
            NativeRecord::ReviewComment { comment, .. } => serde_json::to_string(comment)?,
            NativeRecord::TimelineEvent { event, .. } => serde_json::to_string(event)?,
            NativeRecord::Discussion { discussion, .. } => serde_json::to_string(discussion)?,
            NativeRecord::DiscussionComment { comment, .. } => serde_json::to_string(comment)?,
        };
        Ok(RawPayload {
            id: self.message_id(),
            source_type: self.source_type(),
            native_id: self.native_id(),
            blob,
        })
    }
}

/// Map a native record into a canonical message and the records it references.
pub fn normalize(record: &NativeRecord) -> Result<NormalizedRecord, NormalizeError> {
    match record {
        NativeRecord::SlackMessage {
            team_id,
            channel,
            message,
        } => slack::normalize_message(team_id, channel, message),
        NativeRecord::Issue { repo, issue } => github::normalize_issue(repo, issue),
        NativeRecord::IssueComment { anchor, comment } => {
            github::normalize_comment(anchor, comment)
        }
        NativeRecord::Review { anchor, review } => github::normalize_review(anchor, review),
        NativeRecord::ReviewComment { anchor, comment } => {
            github::normalize_review_comment(anchor, comment)
        }
        NativeRecord::TimelineEvent { anchor, event } => {
            github::normalize_timeline_event(anchor, event)
        }
        NativeRecord::Discussion { repo, discussion } => {
            github::normalize_discussion(repo, discussion)
        }
        NativeRecord::DiscussionComment { anchor, comment } => {
            github::normalize_discussion_comment(anchor, comment)
        }
    }
}

/// Fill mentions, URLs and code blocks from the message's normalized content.
pub(crate) fn populate_entities(message: &mut CanonicalMessage) {
    message.mentions = extract::extract_mentions(&message.content);
    message.urls = extract::extract_urls(&message.content);
    message.code_blocks = extract::extract_code_blocks(&message.content);
}

/// Id of the workspace a Slack team maps to.
pub fn slack_workspace_id(team_id: &str) -> String {
    format!("ws_slack_{}", team_id)
}

/// Id of the workspace a GitHub owner (user or org) maps to.
pub fn github_workspace_id(owner: &str) -> String {
    format!("org_github_{}", owner)
}
