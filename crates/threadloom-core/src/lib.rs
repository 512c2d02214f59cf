//! # Threadloom Core
//!
//! Source-independent logic for threadloom: canonical message models,
//! markup and entity extraction, per-source normalization, the reply
//! graph, heuristic classification, rate limiting and fetch orchestration.
//!
//! This crate performs no network, filesystem or database I/O. Sources and
//! storage are reached through the [`source`], [`store`] and
//! [`ratelimit::RateLimitStore`] traits; the `threadloom` binary crate
//! supplies the HTTP clients and the SQLite store.

pub mod classify;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod graph;
pub mod models;
pub mod normalize;
pub mod ratelimit;
pub mod source;
pub mod store;
