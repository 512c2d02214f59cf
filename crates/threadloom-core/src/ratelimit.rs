//! Windowed self-throttling per `(source, workspace, endpoint)`.
//!
//! The limiter is a thin logical layer over a [`RateLimitStore`]. Its
//! check-then-record sequence is not atomic: two processes sharing one
//! persisted key can both pass [`RateLimiter::check`] before either
//! records. Runs are assumed to be single-writer per key.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::SourceType;

/// Identifies one independently throttled endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub source_type: SourceType,
    pub workspace_id: Option<String>,
    pub endpoint: String,
}

impl RateLimitKey {
    pub fn new(
        source_type: SourceType,
        workspace_id: Option<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            source_type,
            workspace_id,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.workspace_id {
            Some(ws) => write!(f, "{}/{}/{}", self.source_type, ws, self.endpoint),
            None => write!(f, "{}/{}", self.source_type, self.endpoint),
        }
    }
}

/// Window length and request budget for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_secs: i64,
    /// Published platform maximum per window.
    pub max_requests: u32,
    /// Self-imposed cap, at most `max_requests`.
    pub safety_limit: u32,
}

impl RateLimitPolicy {
    pub fn new(window_secs: i64, max_requests: u32, safety_limit: u32) -> Result<Self> {
        let policy = Self {
            window_secs,
            max_requests,
            safety_limit,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_secs <= 0 {
            bail!("rate limit window_secs must be > 0");
        }
        if self.max_requests == 0 {
            bail!("rate limit max_requests must be > 0");
        }
        if self.safety_limit > self.max_requests {
            bail!(
                "rate limit safety_limit ({}) must not exceed max_requests ({})",
                self.safety_limit,
                self.max_requests
            );
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests: 20,
            safety_limit: 10,
        }
    }
}

/// Endpoint name to policy, with a fallback for unknown endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicies {
    endpoints: BTreeMap<String, RateLimitPolicy>,
    fallback: RateLimitPolicy,
}

impl RateLimitPolicies {
    pub fn new(endpoints: BTreeMap<String, RateLimitPolicy>) -> Self {
        Self {
            endpoints,
            fallback: RateLimitPolicy::default(),
        }
    }

    pub fn get(&self, endpoint: &str) -> RateLimitPolicy {
        self.endpoints.get(endpoint).copied().unwrap_or(self.fallback)
    }

    pub fn set(&mut self, endpoint: impl Into<String>, policy: RateLimitPolicy) {
        self.endpoints.insert(endpoint.into(), policy);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RateLimitPolicy)> {
        self.endpoints.iter()
    }
}

impl Default for RateLimitPolicies {
    /// Conservative budgets well under each platform's published maximum.
    fn default() -> Self {
        let mut table = BTreeMap::new();
        let mut put = |name: &str, window_secs, max_requests, safety_limit| {
            table.insert(
                name.to_string(),
                RateLimitPolicy {
                    window_secs,
                    max_requests,
                    safety_limit,
                },
            );
        };
        put(endpoints::SLACK_SEARCH, 60, 20, 10);
        put(endpoints::SLACK_REPLIES, 60, 50, 25);
        put(endpoints::GITHUB_SEARCH, 60, 30, 15);
        put(endpoints::GITHUB_REST, 3600, 5000, 2500);
        put(endpoints::GITHUB_GRAPHQL, 3600, 5000, 2500);
        Self::new(table)
    }
}

/// Endpoint names used as rate-limit keys.
pub mod endpoints {
    pub const SLACK_SEARCH: &str = "search.messages";
    pub const SLACK_REPLIES: &str = "conversations.replies";
    pub const GITHUB_SEARCH: &str = "github.search";
    pub const GITHUB_REST: &str = "github.rest";
    pub const GITHUB_GRAPHQL: &str = "github.graphql";
}

/// Persisted counters for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub requests_made: u32,
    pub window_start: DateTime<Utc>,
    pub window_secs: i64,
    pub max_requests: u32,
    pub safety_limit: u32,
}

/// Where a key currently sits in its window cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPhase {
    WithinWindow,
    WindowExpired,
    LimitReached,
}

impl RateLimitState {
    pub fn fresh(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            requests_made: 0,
            window_start: now,
            window_secs: policy.window_secs,
            max_requests: policy.max_requests,
            safety_limit: policy.safety_limit,
        }
    }

    /// The window resets only once `now` is strictly past its end.
    pub fn phase(&self, now: DateTime<Utc>) -> WindowPhase {
        if now > self.window_start + Duration::seconds(self.window_secs) {
            WindowPhase::WindowExpired
        } else if self.requests_made >= self.safety_limit {
            WindowPhase::LimitReached
        } else {
            WindowPhase::WithinWindow
        }
    }

    pub fn remaining(&self) -> u32 {
        self.safety_limit.saturating_sub(self.requests_made)
    }
}

/// Storage for rate-limit counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Create the state for `key` if absent; leave it untouched otherwise.
    async fn init_rate_limit(&self, key: &RateLimitKey, state: &RateLimitState) -> Result<()>;

    async fn get_rate_limit(&self, key: &RateLimitKey) -> Result<Option<RateLimitState>>;

    /// Increment `requests_made` for `key`.
    async fn record_request(&self, key: &RateLimitKey) -> Result<()>;

    /// Start a new window at `now` with zero requests.
    async fn reset_window(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Result<()>;
}

/// Applies [`RateLimitPolicies`] to keys held in a [`RateLimitStore`].
pub struct RateLimiter<'a> {
    store: &'a dyn RateLimitStore,
    policies: &'a RateLimitPolicies,
}

impl<'a> RateLimiter<'a> {
    pub fn new(store: &'a dyn RateLimitStore, policies: &'a RateLimitPolicies) -> Self {
        Self { store, policies }
    }

    pub async fn init(&self, key: &RateLimitKey) -> Result<()> {
        let policy = self.policies.get(&key.endpoint);
        self.store
            .init_rate_limit(key, &RateLimitState::fresh(&policy, Utc::now()))
            .await
    }

    pub async fn check(&self, key: &RateLimitKey) -> Result<bool> {
        self.check_at(key, Utc::now()).await
    }

    /// Whether a request to `key` may go out at `now`.
    ///
    /// An unknown key is initialized from the endpoint's policy and allowed.
    /// An expired window is reset and allowed.
    pub async fn check_at(&self, key: &RateLimitKey, now: DateTime<Utc>) -> Result<bool> {
        let Some(state) = self.store.get_rate_limit(key).await? else {
            let policy = self.policies.get(&key.endpoint);
            self.store
                .init_rate_limit(key, &RateLimitState::fresh(&policy, now))
                .await?;
            return Ok(true);
        };
        match state.phase(now) {
            WindowPhase::WindowExpired => {
                debug!(key = %key, "rate limit window expired, resetting");
                self.store.reset_window(key, now).await?;
                Ok(true)
            }
            WindowPhase::LimitReached => {
                warn!(
                    key = %key,
                    requests_made = state.requests_made,
                    safety_limit = state.safety_limit,
                    "rate limit safety cap reached"
                );
                Ok(false)
            }
            WindowPhase::WithinWindow => Ok(true),
        }
    }

    /// Count one completed request against `key`.
    pub async fn record(&self, key: &RateLimitKey) -> Result<()> {
        self.store.record_request(key).await
    }
}
