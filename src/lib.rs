//! # Threadloom
//!
//! Native half of the pipeline: SQLite persistence, Slack and GitHub HTTP
//! clients, the snapshot cache, configuration, and the command
//! implementations behind the `loom` binary. Models and algorithms live in
//! [`threadloom_core`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌───────────┐
//! │ Slack/GitHub │──▶│ fetch (core)   │──▶│  SQLite   │
//! │ clients+cache│   │ rate limit +   │   │ messages  │
//! └──────────────┘   │ normalize      │   └─────┬─────┘
//!                    └────────────────┘         │
//!                         ┌─────────────────────┤
//!                         ▼                     ▼
//!                    ┌──────────┐         ┌──────────┐
//!                    │  graph   │         │ classify │
//!                    └──────────┘         └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | `Store` and `RateLimitStore` over SQLite |
//! | [`connector_slack`] | Slack Web API client |
//! | [`connector_github`] | GitHub REST and GraphQL client |
//! | [`cache`] | Cache-aside thread snapshots |
//! | [`progress`] | Fetch progress on stderr |
//! | [`fetch_cmd`] | `loom fetch` |
//! | [`graph_cmd`] | `loom graph` |
//! | [`classify_cmd`] | `loom classify` |
//! | [`select`] | `loom select` |
//! | [`stats`] | `loom stats`, `loom cache` |

pub mod cache;
pub mod classify_cmd;
pub mod config;
pub mod connector_github;
pub mod connector_slack;
pub mod db;
pub mod fetch_cmd;
pub mod graph_cmd;
pub mod migrate;
pub mod progress;
pub mod select;
pub mod sqlite_store;
pub mod stats;
