//! Configuration parsing and validation.
//!
//! Threadloom is configured through a TOML file (default `./config/loom.toml`).
//! The file is read once in `main` and the resulting [`Config`] is passed by
//! reference to every command.
//!
//! ```toml
//! [db]
//! path = "./data/loom.sqlite"
//!
//! [cache]
//! dir = "./data/cache"
//! max_age_secs = 3600
//!
//! [http]
//! timeout_secs = 30
//!
//! [rate_limits."search.messages"]
//! window_secs = 60
//! max_requests = 20
//! safety_limit = 10
//!
//! [slack]
//! token_env = "SLACK_TOKEN"
//!
//! [github]
//! token_env = "GITHUB_TOKEN"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use threadloom_core::error::FetchError;
use threadloom_core::ratelimit::{RateLimitPolicies, RateLimitPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Per-endpoint overrides of the built-in rate-limit policies.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitPolicy>,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub github: GitHubConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_age_secs: default_max_age_secs(),
            enabled: true,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_max_age_secs() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("threadloom/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Environment variable holding the user token.
    #[serde(default = "default_slack_token_env")]
    pub token_env: String,
    #[serde(default = "default_slack_api_base")]
    pub api_base: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token_env: default_slack_token_env(),
            api_base: default_slack_api_base(),
        }
    }
}

impl SlackConfig {
    pub fn token(&self) -> Result<String, FetchError> {
        token_from_env(&self.token_env)
    }
}

fn default_slack_token_env() -> String {
    "SLACK_TOKEN".to_string()
}
fn default_slack_api_base() -> String {
    "https://slack.com/api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    #[serde(default = "default_github_graphql_url")]
    pub graphql_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token_env: default_github_token_env(),
            api_base: default_github_api_base(),
            graphql_url: default_github_graphql_url(),
        }
    }
}

impl GitHubConfig {
    pub fn token(&self) -> Result<String, FetchError> {
        token_from_env(&self.token_env)
    }
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_github_graphql_url() -> String {
    "https://api.github.com/graphql".to_string()
}

impl Config {
    /// Defaults for commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/loom.sqlite"),
            },
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            rate_limits: BTreeMap::new(),
            slack: SlackConfig::default(),
            github: GitHubConfig::default(),
        }
    }

    /// Built-in policies with the `[rate_limits.*]` overrides applied.
    pub fn rate_limit_policies(&self) -> RateLimitPolicies {
        let mut policies = RateLimitPolicies::default();
        for (endpoint, policy) in &self.rate_limits {
            policies.set(endpoint.clone(), *policy);
        }
        policies
    }
}

/// A missing or empty credential is an authentication failure.
fn token_from_env(var: &str) -> Result<String, FetchError> {
    std::env::var(var)
        .ok()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| FetchError::Authentication(format!("{} environment variable not set", var)))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    for (endpoint, policy) in &config.rate_limits {
        policy
            .validate()
            .with_context(|| format!("Invalid [rate_limits.\"{}\"]", endpoint))?;
    }

    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }

    if config.cache.enabled && config.cache.max_age_secs == 0 {
        anyhow::bail!("cache.max_age_secs must be > 0 when the cache is enabled");
    }

    Ok(())
}
