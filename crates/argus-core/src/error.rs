use thiserror::Error;

/// Application-wide error types for Argus.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Malformed input (caller's fault, never retried).
    #[error("validation error: {0}")]
    Validation(String),

    /// An active (non-terminal) scan already exists for this fingerprint.
    ///
    /// Not a failure: callers resolve it by returning the existing record.
    #[error("an active scan already exists for fingerprint {fingerprint}")]
    DuplicateScan { fingerprint: String },

    /// No scan record with the given id.
    #[error("scan {0} not found")]
    NotFound(uuid::Uuid),

    /// The aggregator responded with an error status.
    #[error("aggregator error (HTTP {status_code}): {message}")]
    Upstream {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// Request timed out.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("network error: {0}")]
    Network(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading submitted content from disk failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ScanError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Network(_) | ScanError::Timeout(_) | ScanError::RateLimitExceeded => true,
            ScanError::Upstream { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
