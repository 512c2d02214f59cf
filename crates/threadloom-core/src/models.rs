//! Canonical data models shared by every stage of the pipeline.
//!
//! Source clients produce native records, the [`normalize`](crate::normalize)
//! stage turns them into [`CanonicalMessage`]s plus the [`User`] and
//! [`Channel`] they reference, and the classifier attaches
//! [`Classification`]s keyed by message id.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Platform a record was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Chat-style source (channels, threads keyed by native timestamps).
    Slack,
    /// Issue/PR-style source (issues, pull requests, discussions).
    #[serde(rename = "github")]
    GitHub,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Slack => "slack",
            SourceType::GitHub => "github",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slack" => Ok(SourceType::Slack),
            "github" => Ok(SourceType::GitHub),
            other => anyhow::bail!("Unknown source type: '{}'. Must be slack or github.", other),
        }
    }
}

/// How a code block was delimited in the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeBlockKind {
    /// Triple-backtick or triple-tilde fence.
    Fenced,
    /// Single-backtick span.
    Inline,
    /// `<code>` HTML element.
    Html,
}

/// A code snippet lifted out of message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub kind: CodeBlockKind,
    /// Language tag from a fence info string, when one was given.
    pub language: Option<String>,
    pub code: String,
}

/// The unified, source-agnostic message record.
///
/// `id` is derived deterministically from the source type, the container
/// and the native identifier, so re-normalizing the same native object
/// always upserts the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub id: String,
    pub source_type: SourceType,
    /// Original locator (e.g. `C123:1700000000.000100`, `octo/repo#12`).
    pub source_id: String,
    pub timestamp: DateTime<Utc>,
    pub author_id: String,
    /// Plain text after markup normalization.
    pub content: String,
    pub channel_id: String,
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub is_thread_root: bool,
    pub mentions: BTreeSet<String>,
    pub urls: Vec<String>,
    pub code_blocks: Vec<CodeBlock>,
    /// Source-specific fields with no canonical home (state, labels, ...).
    pub source_metadata: Map<String, Value>,
}

/// Per-source identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub display_name: Option<String>,
    pub real_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

/// Per-source conversation container (a chat channel or a repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub source_type: SourceType,
    pub source_id: String,
    /// Workspace or organization the container belongs to.
    pub workspace_id: Option<String>,
    pub name: String,
    pub display_name: String,
    /// `channel`, `dm` or `repository`.
    pub kind: String,
    pub is_private: bool,
}

/// A message together with the identity and container records it references.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub message: CanonicalMessage,
    pub author: Option<User>,
    pub channel: Option<Channel>,
}

/// Raw native payload, kept verbatim for provenance and re-normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    /// Canonical message id the payload normalizes to.
    pub id: String,
    pub source_type: SourceType,
    pub native_id: String,
    /// JSON text of the native record.
    pub blob: String,
}

/// Label assigned by the heuristic classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationType {
    Question,
    Answer,
    Solution,
    Acknowledgment,
}

impl ClassificationType {
    pub const ALL: [ClassificationType; 4] = [
        ClassificationType::Question,
        ClassificationType::Answer,
        ClassificationType::Solution,
        ClassificationType::Acknowledgment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationType::Question => "question",
            ClassificationType::Answer => "answer",
            ClassificationType::Solution => "solution",
            ClassificationType::Acknowledgment => "acknowledgment",
        }
    }
}

impl fmt::Display for ClassificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClassificationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown classification type: '{}'", s))
    }
}

/// One labeled, confidence-scored classification of a message.
///
/// At most one record exists per `(message_id, kind)`; re-classification
/// overwrites it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: ClassificationType,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Names of the heuristic triggers that fired, in evaluation order.
    pub signals: Vec<String>,
}

/// Per-message facts derived from content, stored next to the
/// classifications and used as `select` filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub message_id: String,
    pub is_question: bool,
    /// Unicode scalar values, not bytes.
    pub char_count: usize,
    pub word_count: usize,
    pub has_code: bool,
    pub has_links: bool,
    /// A line starts with `>`.
    pub has_quotes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_from_str() {
        assert_eq!("slack".parse::<SourceType>().unwrap(), SourceType::Slack);
        assert_eq!("GitHub".parse::<SourceType>().unwrap(), SourceType::GitHub);
        assert!("email".parse::<SourceType>().is_err());
        assert_eq!(SourceType::GitHub.to_string(), "github");
    }

    #[test]
    fn test_classification_serializes_kind_as_type() {
        let c = Classification {
            message_id: "m1".to_string(),
            kind: ClassificationType::Acknowledgment,
            confidence: 0.7,
            signals: vec!["thanks:thanks".to_string()],
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "acknowledgment");
    }
}
