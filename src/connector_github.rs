//! GitHub REST + GraphQL client.
//!
//! Issues, pull requests and their sub-resources come from the REST API
//! (page-numbered, 100 per page). Discussions are only exposed through
//! GraphQL, so discussion search and comments go through `graphql_url`.
//!
//! Status mapping: 401 is an authentication failure; 403 or 429 with an
//! exhausted rate-limit header is a rate-limit failure; any other 403 is an
//! authentication (permission) failure; everything else is a network error.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use threadloom_core::error::FetchError;
use threadloom_core::normalize::{
    Comment, Discussion, DiscussionComment, Issue, Review, ReviewComment, ThreadAnchor,
    TimelineEvent,
};
use threadloom_core::ratelimit::endpoints;
use threadloom_core::source::GitHubSource;

use crate::config::Config;

const PAGE_SIZE: usize = 100;
/// GitHub search never returns more than this many results.
const SEARCH_CAP: usize = 1000;
const GRAPHQL_PAGE_SIZE: usize = 50;

const DISCUSSION_SEARCH_QUERY: &str = r#"
query($q: String!, $first: Int!, $after: String) {
  search(query: $q, type: DISCUSSION, first: $first, after: $after) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on Discussion {
        id number title body createdAt updatedAt url
        author { login avatarUrl }
        category { name }
        repository { nameWithOwner }
      }
    }
  }
}
"#;

const DISCUSSION_COMMENTS_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!, $first: Int!, $after: String) {
  repository(owner: $owner, name: $name) {
    discussion(number: $number) {
      comments(first: $first, after: $after) {
        pageInfo { hasNextPage endCursor }
        nodes {
          id body createdAt url isAnswer
          author { login avatarUrl }
          replies(first: 100) {
            nodes { id body createdAt url isAnswer author { login avatarUrl } }
          }
        }
      }
    }
  }
}
"#;

pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
    graphql_url: String,
}

impl GitHubClient {
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let token = config.github.token()?;
        let http = reqwest::Client::builder()
            .timeout(config.http.timeout())
            .user_agent(&config.http.user_agent)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self {
            http,
            token,
            api_base: config.github.api_base.trim_end_matches('/').to_string(),
            graphql_url: config.github.graphql_url.clone(),
        })
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, req: RequestBuilder, endpoint: &str) -> Result<Response, FetchError> {
        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &headers, &body, endpoint))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        endpoint: &str,
    ) -> Result<T, FetchError> {
        let url = format!("{}{}", self.api_base, path);
        debug!(url = %url, "github request");
        let resp = self
            .send(self.authed(self.http.get(&url)).query(query), endpoint)
            .await?;
        resp.json()
            .await
            .map_err(|e| FetchError::Network(format!("{}: invalid response: {}", path, e)))
    }

    /// Fetch every page of a list endpoint.
    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, FetchError> {
        let mut out = Vec::new();
        for page in 1.. {
            let items: Vec<T> = self
                .get_json(
                    path,
                    &[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())],
                    endpoints::GITHUB_REST,
                )
                .await?;
            let n = items.len();
            out.extend(items);
            if n < PAGE_SIZE {
                break;
            }
        }
        Ok(out)
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, FetchError> {
        let req = self
            .authed(self.http.post(&self.graphql_url))
            .json(&json!({ "query": query, "variables": variables }));
        let resp = self.send(req, endpoints::GITHUB_GRAPHQL).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Network(format!("graphql: invalid response: {}", e)))?;
        check_graphql_errors(&body)?;
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// `/repos/{owner}/{repo}/{collection}/{number}/{resource}`; pull requests
    /// share the `issues` collection for comments and timeline.
    fn thread_path(anchor: &ThreadAnchor, collection: &str, resource: &str) -> String {
        format!(
            "/repos/{}/{}/{}/{}/{}",
            anchor.repo.owner, anchor.repo.name, collection, anchor.number, resource
        )
    }
}

fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str, endpoint: &str) -> FetchError {
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "0")
        || headers.contains_key("retry-after");
    match status.as_u16() {
        401 => FetchError::Authentication(format!("{}: {}", status, body)),
        429 => FetchError::RateLimitExceeded {
            endpoint: endpoint.to_string(),
        },
        403 if exhausted => FetchError::RateLimitExceeded {
            endpoint: endpoint.to_string(),
        },
        403 => FetchError::Authentication(format!("{}: {}", status, body)),
        _ => FetchError::Network(format!("{}: {}", status, body)),
    }
}

fn check_graphql_errors(body: &Value) -> Result<(), FetchError> {
    let Some(errors) = body.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    let Some(first) = errors.first() else {
        return Ok(());
    };
    let message = first
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown GraphQL error")
        .to_string();
    Err(match first.get("type").and_then(Value::as_str) {
        Some("RATE_LIMITED") => FetchError::RateLimitExceeded {
            endpoint: endpoints::GITHUB_GRAPHQL.to_string(),
        },
        Some("FORBIDDEN") => FetchError::Authentication(message),
        _ => FetchError::Network(message),
    })
}

#[derive(Deserialize)]
struct Viewer {
    login: String,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<Issue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscussionSearch {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<CommentNode>,
}

#[derive(Deserialize)]
struct CommentNode {
    #[serde(flatten)]
    comment: DiscussionComment,
    #[serde(default)]
    replies: Option<ReplyConnection>,
}

#[derive(Deserialize)]
struct ReplyConnection {
    #[serde(default)]
    nodes: Vec<DiscussionComment>,
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, FetchError> {
    serde_json::from_value(value)
        .map_err(|e| FetchError::Network(format!("{}: unexpected response shape: {}", what, e)))
}

/// Top-level comments in order, each followed by its replies.
fn flatten_comments(nodes: Vec<CommentNode>) -> Vec<DiscussionComment> {
    let mut out = Vec::new();
    for node in nodes {
        let parent_id = node.comment.id.clone();
        out.push(DiscussionComment {
            reply_to: None,
            ..node.comment
        });
        for reply in node.replies.map(|r| r.nodes).unwrap_or_default() {
            out.push(DiscussionComment {
                reply_to: Some(parent_id.clone()),
                ..reply
            });
        }
    }
    out
}

#[async_trait]
impl GitHubSource for GitHubClient {
    async fn viewer(&self) -> Result<String, FetchError> {
        let viewer: Viewer = self.get_json("/user", &[], endpoints::GITHUB_REST).await?;
        Ok(viewer.login)
    }

    async fn search_issues(&self, query: &str, limit: usize) -> Result<Vec<Issue>, FetchError> {
        let limit = limit.min(SEARCH_CAP);
        let mut out = Vec::new();
        let mut page = 1usize;
        while out.len() < limit {
            let params = [
                ("q", query.to_string()),
                ("sort", "updated".to_string()),
                ("order", "desc".to_string()),
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
            ];
            let resp: SearchPage = self
                .get_json("/search/issues", &params, endpoints::GITHUB_SEARCH)
                .await?;
            let n = resp.items.len();
            out.extend(resp.items);
            if n < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn comments(&self, anchor: &ThreadAnchor) -> Result<Vec<Comment>, FetchError> {
        self.get_all(&Self::thread_path(anchor, "issues", "comments")).await
    }

    async fn reviews(&self, anchor: &ThreadAnchor) -> Result<Vec<Review>, FetchError> {
        self.get_all(&Self::thread_path(anchor, "pulls", "reviews")).await
    }

    async fn review_comments(&self, anchor: &ThreadAnchor) -> Result<Vec<ReviewComment>, FetchError> {
        self.get_all(&Self::thread_path(anchor, "pulls", "comments")).await
    }

    async fn timeline(&self, anchor: &ThreadAnchor) -> Result<Vec<TimelineEvent>, FetchError> {
        self.get_all(&Self::thread_path(anchor, "issues", "timeline")).await
    }

    async fn search_discussions(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Discussion>, FetchError> {
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        while out.len() < limit {
            let first = (limit - out.len()).min(GRAPHQL_PAGE_SIZE);
            let data = self
                .graphql(
                    DISCUSSION_SEARCH_QUERY,
                    json!({ "q": query, "first": first, "after": after }),
                )
                .await?;
            let search: DiscussionSearch =
                decode(data.get("search").cloned().unwrap_or(Value::Null), "discussion search")?;
            for node in search.nodes {
                // Non-discussion nodes come back as empty objects.
                if node.get("id").is_some() {
                    out.push(decode(node, "discussion")?);
                }
            }
            if !search.page_info.has_next_page {
                break;
            }
            after = search.page_info.end_cursor;
        }
        out.truncate(limit);
        Ok(out)
    }

    async fn discussion_comments(
        &self,
        anchor: &ThreadAnchor,
    ) -> Result<Vec<DiscussionComment>, FetchError> {
        let mut nodes = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let data = self
                .graphql(
                    DISCUSSION_COMMENTS_QUERY,
                    json!({
                        "owner": anchor.repo.owner,
                        "name": anchor.repo.name,
                        "number": anchor.number,
                        "first": GRAPHQL_PAGE_SIZE,
                        "after": after,
                    }),
                )
                .await?;
            let connection = data
                .pointer("/repository/discussion/comments")
                .cloned()
                .ok_or_else(|| {
                    FetchError::Network(format!("discussion {} not found", anchor.locator()))
                })?;
            let page: CommentConnection = decode(connection, "discussion comments")?;
            nodes.extend(page.nodes);
            if !page.page_info.has_next_page {
                break;
            }
            after = page.page_info.end_cursor;
        }
        Ok(flatten_comments(nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use threadloom_core::normalize::{RepoRef, ThreadKind};

    fn anchor(kind: ThreadKind) -> ThreadAnchor {
        ThreadAnchor {
            repo: RepoRef::new("octo", "app"),
            kind,
            number: 7,
            updated_at: None,
        }
    }

    #[test]
    fn test_thread_paths() {
        let pr = anchor(ThreadKind::PullRequest);
        assert_eq!(
            GitHubClient::thread_path(&pr, "issues", "comments"),
            "/repos/octo/app/issues/7/comments"
        );
        assert_eq!(
            GitHubClient::thread_path(&pr, "pulls", "comments"),
            "/repos/octo/app/pulls/7/comments"
        );
    }

    #[test]
    fn test_classify_status() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &empty, "", "github.rest"),
            FetchError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty, "", "github.rest"),
            FetchError::Authentication(_)
        ));

        let mut exhausted = HeaderMap::new();
        exhausted.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &exhausted, "", "github.search"),
            FetchError::RateLimitExceeded { endpoint } if endpoint == "github.search"
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &empty, "", "github.rest"),
            FetchError::RateLimitExceeded { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &empty, "", "github.rest"),
            FetchError::Network(_)
        ));
    }

    #[test]
    fn test_graphql_errors() {
        assert!(check_graphql_errors(&json!({"data": {}})).is_ok());
        assert!(matches!(
            check_graphql_errors(&json!({"errors": [{"type": "RATE_LIMITED", "message": "slow down"}]})),
            Err(FetchError::RateLimitExceeded { .. })
        ));
        assert!(matches!(
            check_graphql_errors(&json!({"errors": [{"message": "boom"}]})),
            Err(FetchError::Network(m)) if m == "boom"
        ));
    }

    #[test]
    fn test_flatten_comments_sets_reply_to() {
        let connection = json!({
            "pageInfo": {"hasNextPage": false, "endCursor": null},
            "nodes": [{
                "id": "DC_1", "body": "try this", "createdAt": "2024-03-01T10:00:00Z",
                "isAnswer": true, "author": {"login": "bob", "avatarUrl": "https://a/b.png"},
                "replies": {"nodes": [
                    {"id": "DC_2", "body": "worked, thanks", "createdAt": "2024-03-01T11:00:00Z",
                     "author": {"login": "alice"}}
                ]}
            }]
        });
        let page: CommentConnection = decode(connection, "test").unwrap();
        let flat = flatten_comments(page.nodes);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].reply_to, None);
        assert!(flat[0].is_answer);
        assert_eq!(flat[0].author.as_ref().unwrap().avatar_url.as_deref(), Some("https://a/b.png"));
        assert_eq!(flat[1].reply_to.as_deref(), Some("DC_1"));
    }
}
