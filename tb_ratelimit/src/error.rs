use thiserror::Error;

/// Result type for rate limiting operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitError {
    /// The requested amount is larger than the tokens left after refill
    #[error("Amount exceeded tokens: requested {requested}, available {available}")]
    TokensExceeded { requested: u64, available: u64 },

    /// Store lookup miss. Absorbed by lazy creation inside `Bucket::take`.
    #[error("No such key")]
    NoSuchKey,

    /// Invalid configuration
    #[error("Invalid rate limiter configuration: {0}")]
    InvalidConfig(&'static str),
}

impl RateLimitError {
    /// True when the error is a denial rather than a misconfiguration
    pub fn is_exceeded(&self) -> bool {
        matches!(self, RateLimitError::TokensExceeded { .. })
    }
}
