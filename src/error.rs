//! Error types for the catalog synchronizer

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing a catalog
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Infrastructure Errors (fail open)
    // =========================================================================
    /// Durable store operation failed
    #[error("Durable store error during {operation}: {reason}")]
    Store { operation: String, reason: String },

    /// Durable store operation exceeded its time budget
    #[error("Durable store {operation} timed out after {timeout_ms}ms")]
    StoreTimeout { operation: String, timeout_ms: u64 },

    /// Malformed content digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Key pattern could not be compiled
    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Item Errors (recovered per item)
    // =========================================================================
    /// Origin fetch failed for an item
    #[error("Origin fetch failed for item {item_id}: {reason}")]
    OriginTransient { item_id: u64, reason: String },

    /// Destination write failed
    #[error("Destination write failed: {0}")]
    Destination(String),

    /// Record payload could not be decoded
    #[error("Malformed record for item {item_id}: {reason}")]
    MalformedRecord { item_id: u64, reason: String },

    // =========================================================================
    // Job Errors
    // =========================================================================
    /// Origin rejected our credentials
    #[error("Origin authentication rejected: {0}")]
    OriginAuth(String),

    /// Too many consecutive failures
    #[error("Aborting after {count} consecutive errors (threshold {threshold})")]
    TooManyConsecutiveErrors { count: u32, threshold: u32 },

    /// Another run of the same job holds the lock
    #[error("Job already running: {job_id}")]
    JobAlreadyRunning { job_id: String },

    /// The job lock lease was taken over by another run
    #[error("Job lock lost: {job_id}")]
    LockLost { job_id: String },

    /// Requested state transition is not allowed
    #[error("Invalid job state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a store error for the named operation
    pub fn store(operation: &str, reason: impl std::fmt::Display) -> Self {
        Error::Store {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Errors that end the job in `Failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OriginAuth(_)
                | Error::TooManyConsecutiveErrors { .. }
                | Error::LockLost { .. }
        )
    }

    /// Cache/dedup infrastructure errors, which callers treat as a miss
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Store { .. } | Error::StoreTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::OriginAuth("401".into()).is_fatal());
        assert!(Error::TooManyConsecutiveErrors {
            count: 6,
            threshold: 5
        }
        .is_fatal());
        assert!(!Error::OriginTransient {
            item_id: 1,
            reason: "reset".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_infrastructure_classification() {
        assert!(Error::store("get", "connection refused").is_infrastructure());
        assert!(Error::StoreTimeout {
            operation: "get".into(),
            timeout_ms: 5000
        }
        .is_infrastructure());
        assert!(!Error::Destination("disk full".into()).is_infrastructure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::JobAlreadyRunning {
            job_id: "catalog".into(),
        };
        assert_eq!(err.to_string(), "Job already running: catalog");
    }
}
