//! Error types and retry classification for the resilience layer.
//!
//! This module provides:
//! - [`ProviderError`]: raw failure reported by a protected provider call
//! - [`ErrorKind`] / [`ErrorClassifier`]: the fixed failure taxonomy
//! - [`ResilienceError`]: what the resilience layer hands back to callers
//! - [`RetryClass`]: how a caller should respond to a [`ResilienceError`]

mod classifier;
mod retry;

pub use classifier::{ErrorClassifier, ErrorKind, ErrorPolicy};
pub use retry::RetryClass;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Raw failure from a provider call (HTTP client, SDK, socket).
///
/// Provider adapters convert whatever their client returns into this type so
/// the classifier sees a uniform shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// The call did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The transport failed (refused, reset, DNS).
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Anything else, classified from the message text.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Classify this failure.
    pub fn kind(&self) -> ErrorKind {
        ErrorClassifier::classify(self)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Other(e.to_string())
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        match e.kind() {
            Io::TimedOut => Self::Timeout(e.to_string()),
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::AddrNotAvailable
            | Io::BrokenPipe => Self::Connection(e.to_string()),
            _ => Self::Other(e.to_string()),
        }
    }
}

/// Errors surfaced by the resilience layer.
///
/// Each variant is classified into a [`RetryClass`] via
/// [`retry_class`](Self::retry_class).
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// The provider's token bucket denied the request.
    #[error("Rate limit exceeded: {provider}")]
    RateLimitExceeded {
        /// Provider whose bucket is empty
        provider: String,
    },

    /// The provider's circuit is open; no call was attempted.
    #[error("Circuit open: {provider}")]
    CircuitOpen {
        /// Provider with an open circuit
        provider: String,
    },

    /// A single fallback step ran past its sub-deadline.
    #[error("Step '{step}' timed out after {timeout:?}")]
    StepTimeout {
        /// Step name
        step: String,
        /// Effective timeout that fired
        timeout: Duration,
    },

    /// The whole fallback chain ran out of budget.
    #[error("Total timeout of {budget:?} exceeded")]
    TotalTimeoutExceeded {
        /// Total budget for the chain
        budget: Duration,
    },

    /// A quota-gated provider has no calls left until `reset_at`.
    #[error("Quota exhausted: {provider} (resets at {reset_at})")]
    QuotaExhausted {
        /// Quota-gated provider
        provider: String,
        /// Next quota reset instant
        reset_at: DateTime<Utc>,
    },

    /// Retryable failure (timeout, throttling, network, 5xx, unknown).
    #[error("Transient failure from {provider} ({kind}): {source}")]
    Transient {
        provider: String,
        kind: ErrorKind,
        #[source]
        source: ProviderError,
    },

    /// Non-retryable failure (auth or client error by default).
    #[error("Permanent failure from {provider} ({kind}): {source}")]
    Permanent {
        provider: String,
        kind: ErrorKind,
        #[source]
        source: ProviderError,
    },
}

impl ResilienceError {
    /// Wrap a raw provider failure, deciding transient vs permanent from the
    /// given policy.
    pub fn from_provider(provider: &str, source: ProviderError, policy: &ErrorPolicy) -> Self {
        let kind = source.kind();
        if policy.is_retryable(kind) {
            Self::Transient {
                provider: provider.to_string(),
                kind,
                source,
            }
        } else {
            Self::Permanent {
                provider: provider.to_string(),
                kind,
                source,
            }
        }
    }

    /// The classified kind behind this error, where one applies.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Transient { kind, .. } | Self::Permanent { kind, .. } => Some(*kind),
            Self::RateLimitExceeded { .. } | Self::QuotaExhausted { .. } => {
                Some(ErrorKind::RateLimited)
            }
            Self::StepTimeout { .. } | Self::TotalTimeoutExceeded { .. } => {
                Some(ErrorKind::Timeout)
            }
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use enrichment_resilience::errors::{ResilienceError, RetryClass};
    ///
    /// let error = ResilienceError::CircuitOpen { provider: "openai".to_string() };
    /// assert_eq!(error.retry_class(), RetryClass::FailFast);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Permanent { .. } | Self::TotalTimeoutExceeded { .. } => RetryClass::Never,
            Self::Transient { .. } | Self::RateLimitExceeded { .. } => RetryClass::WithBackoff,
            Self::StepTimeout { .. } => RetryClass::NextStep,
            Self::QuotaExhausted { .. } => RetryClass::Defer,
            Self::CircuitOpen { .. } => RetryClass::FailFast,
        }
    }

    /// Provider the error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimitExceeded { provider }
            | Self::CircuitOpen { provider }
            | Self::QuotaExhausted { provider, .. }
            | Self::Transient { provider, .. }
            | Self::Permanent { provider, .. } => Some(provider),
            Self::StepTimeout { .. } | Self::TotalTimeoutExceeded { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_is_permanent() {
        let error = ResilienceError::from_provider(
            "openai",
            ProviderError::http(401, "invalid api key"),
            &ErrorPolicy::default(),
        );
        assert!(matches!(error, ResilienceError::Permanent { kind: ErrorKind::AuthError, .. }));
        assert_eq!(error.retry_class(), RetryClass::Never);
    }

    #[test]
    fn test_server_error_is_transient() {
        let error = ResilienceError::from_provider(
            "openai",
            ProviderError::http(503, "unavailable"),
            &ErrorPolicy::default(),
        );
        assert_eq!(error.kind(), Some(ErrorKind::ServerError));
        assert_eq!(error.retry_class(), RetryClass::WithBackoff);
    }

    #[test]
    fn test_policy_can_make_client_errors_retryable() {
        let policy = ErrorPolicy::with_permanent([ErrorKind::AuthError]);
        let error =
            ResilienceError::from_provider("geo", ProviderError::http(404, "missing"), &policy);
        assert!(matches!(error, ResilienceError::Transient { .. }));
    }

    #[test]
    fn test_quota_exhausted_defers() {
        let error = ResilienceError::QuotaExhausted {
            provider: "geo".to_string(),
            reset_at: Utc::now(),
        };
        assert_eq!(error.retry_class(), RetryClass::Defer);
        assert_eq!(error.provider(), Some("geo"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error: ProviderError = io.into();
        assert_eq!(error.kind(), ErrorKind::Network);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let error: ProviderError = io.into();
        assert_eq!(error.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_error_display() {
        let error = ResilienceError::CircuitOpen {
            provider: "anthropic".to_string(),
        };
        assert_eq!(format!("{}", error), "Circuit open: anthropic");

        let error = ResilienceError::RateLimitExceeded {
            provider: "nominatim".to_string(),
        };
        assert_eq!(format!("{}", error), "Rate limit exceeded: nominatim");
    }
}
