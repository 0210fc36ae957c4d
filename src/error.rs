//! Error types for the failover buffer.
//!
//! Buffering itself never fails: skips, evictions and timeouts are reported
//! as [`WaitOutcome`](crate::types::WaitOutcome) values. Errors only come
//! out of construction and configuration paths.

use thiserror::Error;

/// Result type alias for failover buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the failover buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// A `keyspace/shard` string could not be parsed.
    #[error("invalid shard key: {0:?}")]
    InvalidShardKey(String),
}

impl Error {
    /// Build a configuration error for a named field.
    pub(crate) fn config(field: &str, reason: impl std::fmt::Display) -> Self {
        Error::Config(format!("{field}: {reason}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("max_buffer_size", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "config error: max_buffer_size: must be greater than 0"
        );

        let err = Error::InvalidShardKey("ks/".into());
        assert_eq!(err.to_string(), "invalid shard key: \"ks/\"");
    }
}
