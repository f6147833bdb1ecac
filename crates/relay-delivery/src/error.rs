//! Error types for event delivery operations.
//!
//! Every failure carries enough context to classify the attempt it came
//! from: transient failures feed the retry machinery, permanent failures
//! exhaust the delivery immediately.

use relay_core::AttemptOutcome;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for event delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request timed out.
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx).
        status_code: u16,
        /// Truncated response body.
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx).
        status_code: u16,
        /// Truncated response body.
        body: String,
    },

    /// Invalid processor config, e.g. an unparseable target URL.
    #[error("invalid processor configuration: {message}")]
    Configuration {
        /// Configuration error message.
        message: String,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    Database {
        /// Database error message.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Whether this failure is worth retrying.
    ///
    /// Network errors, timeouts, 5xx responses, and database failures are
    /// transient. 4xx responses and configuration errors are permanent:
    /// the request itself is wrong and re-sending it cannot help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::Database { .. } => true,

            Self::ClientError { .. } | Self::Configuration { .. } => false,
        }
    }

    /// Classifies this error as an attempt outcome.
    pub fn outcome(&self) -> AttemptOutcome {
        if self.is_retryable() {
            AttemptOutcome::TransientFailure
        } else {
            AttemptOutcome::PermanentFailure
        }
    }
}

impl From<relay_core::CoreError> for DeliveryError {
    fn from(err: relay_core::CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(500, "internal server error").is_retryable());
        assert!(DeliveryError::database("connection lost").is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::client_error(429, "slow down").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
    }

    #[test]
    fn outcomes_follow_retryability() {
        assert_eq!(DeliveryError::timeout(30).outcome(), AttemptOutcome::TransientFailure);
        assert_eq!(
            DeliveryError::client_error(400, "bad request").outcome(),
            AttemptOutcome::PermanentFailure
        );
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::server_error(503, "unavailable").to_string(),
            "server error: HTTP 503"
        );
    }
}
