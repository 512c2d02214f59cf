//! Chat-source records and their normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NormalizeError;
use crate::extract::normalize_markup;
use crate::models::{CanonicalMessage, Channel, NormalizedRecord, SourceType, User};

use super::{populate_entities, slack_workspace_id};

/// Channel reference embedded in search matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackChannelRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_mpim: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackUserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub image_72: Option<String>,
}

/// A chat message as returned by either search or thread-replies calls.
///
/// Search matches carry `channel` and `permalink`; thread replies carry
/// neither, so the channel comes from the match that led to the thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    /// Native `seconds.micros` timestamp, unique within a channel.
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub channel: Option<SlackChannelRef>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub reply_count: Option<u64>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user_profile: Option<SlackUserProfile>,
}

impl SlackMessage {
    /// Thread timestamp from the record, falling back to the permalink's
    /// `thread_ts` query parameter (search results often omit the field).
    pub fn resolve_thread_ts(&self) -> Option<String> {
        if let Some(ts) = self.thread_ts.as_deref().filter(|t| !t.is_empty()) {
            return Some(ts.to_string());
        }
        let permalink = self.permalink.as_deref()?;
        let (_, query) = permalink.split_once('?')?;
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("thread_ts="))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    /// True when this message starts its thread (or is not in one).
    pub fn is_thread_root(&self) -> bool {
        match self.resolve_thread_ts() {
            None => true,
            Some(thread_ts) => thread_ts == self.ts,
        }
    }
}

pub fn message_id(team_id: &str, channel_id: &str, ts: &str) -> String {
    format!("msg_slack_{}_{}_{}", team_id, channel_id, ts)
}

pub fn user_id(team_id: &str, native_user: &str) -> String {
    format!("user_slack_{}_{}", team_id, native_user)
}

pub fn channel_id(team_id: &str, native_channel: &str) -> String {
    format!("chan_slack_{}_{}", team_id, native_channel)
}

/// Parse a `seconds.micros` timestamp.
pub fn parse_ts(ts: &str) -> Result<DateTime<Utc>, NormalizeError> {
    let invalid = |reason: &str| NormalizeError::InvalidTimestamp {
        value: ts.to_string(),
        reason: reason.to_string(),
    };
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("seconds part is not a number"));
    }
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("fractional part is not a number"));
    }
    let secs: i64 = secs.parse().map_err(|_| invalid("seconds out of range"))?;
    let nanos: u32 = if frac.is_empty() {
        0
    } else {
        let scaled = format!("{:0<9}", frac);
        scaled.parse().map_err(|_| invalid("fractional part out of range"))?
    };
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| invalid("timestamp out of range"))
}

pub(crate) fn normalize_message(
    team_id: &str,
    channel: &SlackChannelRef,
    msg: &SlackMessage,
) -> Result<NormalizedRecord, NormalizeError> {
    let timestamp = parse_ts(&msg.ts)?;
    let native_author = msg
        .user
        .as_deref()
        .or(msg.bot_id.as_deref())
        .filter(|u| !u.is_empty())
        .ok_or(NormalizeError::MissingField("user"))?;

    let id = message_id(team_id, &channel.id, &msg.ts);
    let chan_id = channel_id(team_id, &channel.id);
    let (thread_id, parent_id, is_root) = match msg.resolve_thread_ts() {
        Some(thread_ts) if thread_ts != msg.ts => {
            let root = message_id(team_id, &channel.id, &thread_ts);
            (root.clone(), Some(root), false)
        }
        _ => (id.clone(), None, true),
    };

    let mut metadata = Map::new();
    metadata.insert("team".into(), Value::String(team_id.to_string()));
    if let Some(name) = &channel.name {
        metadata.insert("channel_name".into(), Value::String(name.clone()));
    }
    if let Some(permalink) = &msg.permalink {
        metadata.insert("permalink".into(), Value::String(permalink.clone()));
    }
    if let Some(count) = msg.reply_count {
        metadata.insert("reply_count".into(), Value::from(count));
    }
    if let Some(subtype) = &msg.subtype {
        metadata.insert("subtype".into(), Value::String(subtype.clone()));
    }

    let mut message = CanonicalMessage {
        id,
        source_type: SourceType::Slack,
        source_id: format!("{}:{}", channel.id, msg.ts),
        timestamp,
        author_id: user_id(team_id, native_author),
        content: normalize_markup(&msg.text),
        channel_id: chan_id.clone(),
        thread_id,
        parent_id,
        is_thread_root: is_root,
        mentions: Default::default(),
        urls: Vec::new(),
        code_blocks: Vec::new(),
        source_metadata: metadata,
    };
    populate_entities(&mut message);

    let profile = msg.user_profile.as_ref();
    let author = User {
        id: message.author_id.clone(),
        source_type: SourceType::Slack,
        source_id: native_author.to_string(),
        display_name: profile
            .and_then(|p| p.display_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| msg.username.clone()),
        real_name: profile.and_then(|p| p.real_name.clone()),
        email: None,
        avatar_url: profile.and_then(|p| p.image_72.clone()),
    };

    let name = channel.name.clone().unwrap_or_else(|| channel.id.clone());
    let is_dm = channel.is_im || channel.is_mpim || channel.id.starts_with('D');
    let channel = Channel {
        id: chan_id,
        source_type: SourceType::Slack,
        source_id: channel.id.clone(),
        workspace_id: Some(slack_workspace_id(team_id)),
        display_name: if is_dm { name.clone() } else { format!("#{}", name) },
        name,
        kind: if is_dm { "dm" } else { "channel" }.to_string(),
        is_private: channel.is_private || is_dm,
    };

    Ok(NormalizedRecord {
        message,
        author: Some(author),
        channel: Some(channel),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, NativeRecord};

    fn channel() -> SlackChannelRef {
        SlackChannelRef {
            id: "C42".into(),
            name: Some("general".into()),
            is_private: false,
            is_im: false,
            is_mpim: false,
        }
    }

    fn message(ts: &str, thread_ts: Option<&str>, text: &str) -> SlackMessage {
        SlackMessage {
            ts: ts.into(),
            thread_ts: thread_ts.map(String::from),
            text: text.into(),
            user: Some("U1".into()),
            username: Some("alice".into()),
            bot_id: None,
            team: Some("T1".into()),
            channel: Some(channel()),
            permalink: None,
            reply_count: None,
            subtype: None,
            user_profile: None,
        }
    }

    fn record(msg: SlackMessage) -> NativeRecord {
        NativeRecord::SlackMessage {
            team_id: "T1".into(),
            channel: channel(),
            message: msg,
        }
    }

    #[test]
    fn test_parse_ts() {
        let t = parse_ts("1700000000.000100").unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_micros(), 100);
        assert!(parse_ts("1700000000").is_ok());
        assert!(parse_ts("not-a-ts").is_err());
        assert!(parse_ts("17.x").is_err());
        assert!(parse_ts("").is_err());
    }

    #[test]
    fn test_standalone_message_is_root() {
        let out = normalize(&record(message("1700000000.000100", None, "hello"))).unwrap();
        let m = out.message;
        assert_eq!(m.id, "msg_slack_T1_C42_1700000000.000100");
        assert!(m.is_thread_root);
        assert_eq!(m.thread_id, m.id);
        assert_eq!(m.parent_id, None);
        assert_eq!(m.author_id, "user_slack_T1_U1");
        assert_eq!(m.channel_id, "chan_slack_T1_C42");
    }

    #[test]
    fn test_thread_ts_equal_to_ts_is_root() {
        let out = normalize(&record(message("5.000001", Some("5.000001"), "root"))).unwrap();
        assert!(out.message.is_thread_root);
    }

    #[test]
    fn test_reply_points_at_root() {
        let out = normalize(&record(message("6.000001", Some("5.000001"), "reply"))).unwrap();
        let m = out.message;
        assert!(!m.is_thread_root);
        assert_eq!(m.thread_id, "msg_slack_T1_C42_5.000001");
        assert_eq!(m.parent_id.as_deref(), Some("msg_slack_T1_C42_5.000001"));
    }

    #[test]
    fn test_thread_ts_recovered_from_permalink() {
        let mut msg = message("6.000001", None, "reply");
        msg.permalink = Some(
            "https://acme.slack.com/archives/C42/p6000001?thread_ts=5.000001&cid=C42".into(),
        );
        assert_eq!(msg.resolve_thread_ts().as_deref(), Some("5.000001"));
        let out = normalize(&record(msg)).unwrap();
        assert_eq!(out.message.thread_id, "msg_slack_T1_C42_5.000001");
    }

    #[test]
    fn test_content_and_entities() {
        let out = normalize(&record(message(
            "1.000001",
            None,
            "<@U2|bob> try `make test` see <https://ci.example.com|ci>",
        )))
        .unwrap();
        let m = out.message;
        assert_eq!(m.content, "@bob try `make test` see ci (https://ci.example.com)");
        assert!(m.mentions.contains("bob"));
        assert_eq!(m.urls, vec!["https://ci.example.com"]);
        assert_eq!(m.code_blocks.len(), 1);
    }

    #[test]
    fn test_invalid_ts_is_error() {
        let err = normalize(&record(message("garbage", None, "x"))).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidTimestamp { .. }));
    }

    #[test]
    fn test_missing_author_is_error() {
        let mut msg = message("1.0", None, "x");
        msg.user = None;
        let err = normalize(&record(msg)).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingField("user")));
    }

    #[test]
    fn test_bot_author_fallback() {
        let mut msg = message("1.0", None, "deployed");
        msg.user = None;
        msg.bot_id = Some("B9".into());
        let out = normalize(&record(msg)).unwrap();
        assert_eq!(out.message.author_id, "user_slack_T1_B9");
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let rec = record(message("9.000001", Some("8.000001"), "<@U2|bob> &amp; me"));
        let a = normalize(&rec).unwrap();
        let b = normalize(&rec).unwrap();
        assert_eq!(a, b);
        assert_eq!(rec.message_id(), a.message.id);
    }

    #[test]
    fn test_channel_and_user_records() {
        let out = normalize(&record(message("1.0", None, "x"))).unwrap();
        let channel = out.channel.unwrap();
        assert_eq!(channel.workspace_id.as_deref(), Some("ws_slack_T1"));
        assert_eq!(channel.display_name, "#general");
        assert_eq!(channel.kind, "channel");
        let user = out.author.unwrap();
        assert_eq!(user.display_name.as_deref(), Some("alice"));
    }
}
