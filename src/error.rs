//! Error types for the caching subsystem
//!
//! Every failure mode here has a defined fallback in the component that
//! raises it. Only [`Error::SourceFetch`] and [`Error::FetchTimeout`] can
//! reach a caller, and only when no stale or fallback value exists.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the caching subsystem
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Upstream fetcher returned an error
    #[error("Source fetch failed for {key}: {source}")]
    SourceFetch {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Upstream fetcher did not complete in time
    #[error("Source fetch for {key} timed out after {timeout:?}")]
    FetchTimeout { key: String, timeout: Duration },

    /// Could not acquire or observe release of a stampede lock in time
    #[error("Lock wait for {key} timed out after {waited:?}")]
    LockTimeout { key: String, waited: Duration },

    /// Shared tier could not be reached
    #[error("Shared tier unavailable: {0}")]
    SharedTierUnavailable(String),

    /// An entry could not be cleared
    #[error("Invalidation failed for {key}: {reason}")]
    InvalidationFailed { key: String, reason: String },

    /// Shared-tier payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Service registry error
    #[error("Service registry error: {0}")]
    Registry(String),

    /// Component has been shut down
    #[error("Subsystem is shutting down")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::SharedTierUnavailable(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::SharedTierUnavailable(format!("connection pool: {}", e))
    }
}

impl Error {
    /// Wrap a fetcher error for the given cache key
    pub fn source_fetch(key: impl Into<String>, source: anyhow::Error) -> Self {
        Error::SourceFetch {
            key: key.into(),
            source,
        }
    }

    /// True for failures of the upstream source (error or timeout)
    pub fn is_source_failure(&self) -> bool {
        matches!(self, Error::SourceFetch { .. } | Error::FetchTimeout { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failure_classification() {
        let fetch = Error::source_fetch("user:u1", anyhow::anyhow!("db down"));
        assert!(fetch.is_source_failure());

        let timeout = Error::FetchTimeout {
            key: "user:u1".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_source_failure());

        assert!(!Error::SharedTierUnavailable("refused".into()).is_source_failure());
        assert!(!Error::Shutdown.is_source_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::source_fetch("event:e1", anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "Source fetch failed for event:e1: boom");

        let err = Error::InvalidationFailed {
            key: "user:u1".to_string(),
            reason: "connection reset".to_string(),
        };
        assert!(err.to_string().contains("user:u1"));
    }
}
