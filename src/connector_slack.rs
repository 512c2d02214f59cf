//! Slack Web API client.
//!
//! Implements [`SlackSource`] over three methods:
//!
//! | Call | Method |
//! |------|--------|
//! | `identity` | `auth.test` |
//! | `search_messages` | `search.messages` (paged, 100 per page) |
//! | `thread_replies` | `conversations.replies` (cursor-paged) |
//!
//! The API reports most failures as HTTP 200 with `"ok": false`; both the
//! status code and the `error` field are mapped onto [`FetchError`].

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use threadloom_core::error::FetchError;
use threadloom_core::normalize::SlackMessage;
use threadloom_core::ratelimit::endpoints;
use threadloom_core::source::{SlackIdentity, SlackSource};

use crate::config::Config;

const SEARCH_PAGE_SIZE: usize = 100;
const REPLIES_PAGE_SIZE: usize = 200;

pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl SlackClient {
    /// Build a client from `[slack]` and `[http]`; fails when the token
    /// environment variable is unset.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let token = config.slack.token()?;
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .user_agent(&config.http.user_agent)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            http,
            token,
            api_base: config.slack.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, method: &str, endpoint: &str, params: &[(&str, String)]) -> Result<Value, FetchError> {
        let url = format!("{}/{}", self.api_base, method);
        debug!(method, "slack request");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(params)
            .send()
            .await
            .map_err(|e| FetchError::Network(format!("{}: {}", method, e)))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimitExceeded {
                endpoint: endpoint.to_string(),
            });
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(FetchError::Authentication(format!("{} returned {}", method, status)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Network(format!("{} returned {}: {}", method, status, body)));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Network(format!("{}: invalid response: {}", method, e)))?;
        check_ok(&json, endpoint)?;
        Ok(json)
    }
}

/// Map an `"ok": false` body onto the error taxonomy.
fn check_ok(json: &Value, endpoint: &str) -> Result<(), FetchError> {
    if json.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }
    let code = json
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown_error");
    Err(match code {
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" | "token_expired"
        | "missing_scope" | "no_permission" => FetchError::Authentication(code.to_string()),
        "ratelimited" | "rate_limited" => FetchError::RateLimitExceeded {
            endpoint: endpoint.to_string(),
        },
        other => FetchError::Network(other.to_string()),
    })
}

#[derive(Deserialize)]
struct AuthTest {
    team_id: String,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    messages: SearchMessages,
}

#[derive(Deserialize)]
struct SearchMessages {
    #[serde(default)]
    matches: Vec<SlackMessage>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Deserialize)]
struct Paging {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    pages: u32,
}

#[derive(Deserialize)]
struct RepliesResponse {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(json: Value, method: &str) -> Result<T, FetchError> {
    serde_json::from_value(json)
        .map_err(|e| FetchError::Network(format!("{}: unexpected response shape: {}", method, e)))
}

#[async_trait]
impl SlackSource for SlackClient {
    async fn identity(&self) -> Result<SlackIdentity, FetchError> {
        let json = self.call("auth.test", "auth.test", &[]).await?;
        let auth: AuthTest = decode(json, "auth.test")?;
        Ok(SlackIdentity {
            team_id: auth.team_id,
            team_name: auth.team,
            user_id: auth.user_id,
        })
    }

    async fn search_messages(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SlackMessage>, FetchError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        while out.len() < limit {
            let count = (limit - out.len()).min(SEARCH_PAGE_SIZE);
            let params = [
                ("query", query.to_string()),
                ("count", count.to_string()),
                ("page", page.to_string()),
                ("sort", "timestamp".to_string()),
                ("sort_dir", "desc".to_string()),
            ];
            let json = self
                .call("search.messages", endpoints::SLACK_SEARCH, &params)
                .await?;
            let resp: SearchResponse = decode(json, "search.messages")?;
            let fetched = resp.messages.matches.len();
            out.extend(resp.messages.matches);

            let last_page = resp
                .messages
                .paging
                .map_or(true, |p| p.page >= p.pages);
            if fetched == 0 || last_page {
                break;
            }
            page += 1;
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn thread_replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, FetchError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = vec![
                ("channel", channel_id.to_string()),
                ("ts", thread_ts.to_string()),
                ("limit", REPLIES_PAGE_SIZE.to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let json = self
                .call("conversations.replies", endpoints::SLACK_REPLIES, &params)
                .await?;
            let resp: RepliesResponse = decode(json, "conversations.replies")?;
            out.extend(resp.messages);

            cursor = resp
                .response_metadata
                .and_then(|m| m.next_cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_ok_maps_error_codes() {
        assert!(check_ok(&json!({"ok": true}), "x").is_ok());
        assert!(matches!(
            check_ok(&json!({"ok": false, "error": "invalid_auth"}), "x"),
            Err(FetchError::Authentication(_))
        ));
        assert!(matches!(
            check_ok(&json!({"ok": false, "error": "ratelimited"}), "search.messages"),
            Err(FetchError::RateLimitExceeded { endpoint }) if endpoint == "search.messages"
        ));
        assert!(matches!(
            check_ok(&json!({"ok": false, "error": "channel_not_found"}), "x"),
            Err(FetchError::Network(_))
        ));
        assert!(matches!(check_ok(&json!({}), "x"), Err(FetchError::Network(_))));
    }

    #[test]
    fn test_search_response_decodes_matches() {
        let body = json!({
            "ok": true,
            "messages": {
                "matches": [{
                    "ts": "1700000000.000100",
                    "text": "how do I <#C1|deploy>?",
                    "user": "U1",
                    "team": "T1",
                    "channel": {"id": "C1", "name": "deploy", "is_private": false},
                    "permalink": "https://x.slack.com/archives/C1/p1700000000000100?thread_ts=1699999999.000001"
                }],
                "paging": {"count": 20, "total": 1, "page": 1, "pages": 1}
            }
        });
        let resp: SearchResponse = decode(body, "search.messages").unwrap();
        let m = &resp.messages.matches[0];
        assert_eq!(m.channel.as_ref().unwrap().id, "C1");
        assert_eq!(m.resolve_thread_ts().as_deref(), Some("1699999999.000001"));
        assert_eq!(resp.messages.paging.unwrap().pages, 1);
    }

    #[test]
    fn test_replies_cursor() {
        let body = json!({
            "ok": true,
            "messages": [{"ts": "1.000001", "thread_ts": "1.000001", "text": "root", "user": "U1"}],
            "has_more": true,
            "response_metadata": {"next_cursor": "bmV4dA=="}
        });
        let resp: RepliesResponse = decode(body, "conversations.replies").unwrap();
        assert_eq!(resp.messages.len(), 1);
        assert_eq!(
            resp.response_metadata.and_then(|m| m.next_cursor).as_deref(),
            Some("bmV4dA==")
        );
    }
}
