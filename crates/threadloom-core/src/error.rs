//! Typed errors for the normalization and fetch stages.
//!
//! Everything else in the crate reports failures through `anyhow`; these
//! two enums exist because callers branch on the variant.

use thiserror::Error;

/// Failure to map one native record into the canonical schema.
///
/// Always scoped to a single record: the fetch run skips it and continues.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("failed to encode source metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Failure while talking to a source or persisting what it returned.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Missing or rejected credentials. Aborts the whole run.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Either the local limiter refused the call or the remote returned a
    /// limit response. Stops the batch early; partial results are kept.
    #[error("rate limit exceeded for {endpoint}")]
    RateLimitExceeded { endpoint: String },

    /// Transport failure or unexpected response for a single call.
    #[error("network error: {0}")]
    Network(String),

    #[error("normalization error: {0}")]
    Normalization(#[from] NormalizeError),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl FetchError {
    /// Whether the error aborts the run instead of skipping one item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Authentication(_))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        FetchError::Persistence(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authentication_is_fatal() {
        assert!(FetchError::Authentication("bad token".into()).is_fatal());
        assert!(!FetchError::RateLimitExceeded {
            endpoint: "search.messages".into()
        }
        .is_fatal());
        assert!(!FetchError::Network("timeout".into()).is_fatal());
        assert!(!FetchError::Normalization(NormalizeError::MissingField("ts")).is_fatal());
        assert!(!FetchError::Persistence("disk full".into()).is_fatal());
    }

    #[test]
    fn test_persistence_keeps_context_chain() {
        let err = anyhow::anyhow!("constraint failed").context("saving message m1");
        let msg = FetchError::persistence(err).to_string();
        assert!(msg.contains("saving message m1"));
        assert!(msg.contains("constraint failed"));
    }
}
