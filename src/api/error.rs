use std::time::Duration;
use thiserror::Error;

/// Failure modes of an exchange request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited by exchange (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("IP banned by exchange (retry after {retry_after:?})")]
    Banned { retry_after: Option<Duration> },

    #[error("Exchange server error ({status})")]
    Server { status: u16 },

    #[error("Symbol not found: {0}")]
    NotFound(String),

    #[error("Exchange API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode exchange response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Whether another attempt within the same cycle may succeed.
    ///
    /// A ban is never retried in-cycle; the mandated backoff is enforced by the rate budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_)
                | ExchangeError::Timeout
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Server { .. }
        )
    }

    /// Backoff explicitly requested by the exchange, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited { retry_after } | ExchangeError::Banned { retry_after } => {
                *retry_after
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}
