//! Error classification for provider failures.
//!
//! Every failure coming back from a protected provider is reduced to a single
//! [`ErrorKind`]. The circuit breaker, the retry executor and the deferred
//! scheduler all make their decisions from that kind alone.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ProviderError;

/// Message fragments that indicate a timeout.
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

/// Message fragments that indicate provider-side throttling.
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota exceeded",
    "api call frequency",
];

/// Message fragments that indicate a transport failure.
const NETWORK_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "broken pipe",
    "dns error",
    "failed to lookup address",
    "name resolution",
    "unreachable",
    "network is down",
];

/// Fixed taxonomy of provider failures.
///
/// Ordered roughly from "most likely to recover by itself" to "will never
/// recover without a human".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    RateLimited,
    Network,
    ServerError,
    AuthError,
    ClientError,
    Unknown,
}

impl ErrorKind {
    /// All kinds, in classification priority order.
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::Network,
        ErrorKind::ServerError,
        ErrorKind::AuthError,
        ErrorKind::ClientError,
        ErrorKind::Unknown,
    ];

    /// Returns the string representation of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Network => "NETWORK",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown error kind: {}", s))
    }
}

/// Maps raw provider failures onto [`ErrorKind`].
///
/// Rules are applied in priority order and the first match wins:
///
/// | Signal | Kind |
/// |--------|------|
/// | explicit timeout (variant, HTTP 408, message) | `Timeout` |
/// | HTTP 429 or rate-limit marker in message | `RateLimited` |
/// | connection / DNS / unreachable | `Network` |
/// | HTTP 5xx | `ServerError` |
/// | HTTP 401 / 403 | `AuthError` |
/// | other HTTP 4xx | `ClientError` |
/// | anything else | `Unknown` |
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a provider failure. Pure; never panics.
    pub fn classify(failure: &ProviderError) -> ErrorKind {
        let (status, message) = match failure {
            ProviderError::Timeout(_) => return ErrorKind::Timeout,
            ProviderError::Http { status, message } => (Some(*status), message.as_str()),
            ProviderError::Connection(message) => {
                if contains_marker(message, TIMEOUT_MARKERS) {
                    return ErrorKind::Timeout;
                }
                if contains_marker(message, RATE_LIMIT_MARKERS) {
                    return ErrorKind::RateLimited;
                }
                return ErrorKind::Network;
            }
            ProviderError::Other(message) => (None, message.as_str()),
        };

        // These statuses are unambiguous whatever the body says.
        if let Some(code) = status {
            let kind = Self::classify_status(code);
            if matches!(
                kind,
                ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::AuthError
            ) {
                return kind;
            }
        }

        if contains_marker(message, TIMEOUT_MARKERS) {
            return ErrorKind::Timeout;
        }
        if contains_marker(message, RATE_LIMIT_MARKERS) {
            return ErrorKind::RateLimited;
        }
        if contains_marker(message, NETWORK_MARKERS) {
            return ErrorKind::Network;
        }

        match status {
            Some(code) => Self::classify_status(code),
            None => ErrorKind::Unknown,
        }
    }

    /// Classify a bare HTTP status code.
    pub fn classify_status(status: u16) -> ErrorKind {
        match status {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            401 | 403 => ErrorKind::AuthError,
            400..=499 => ErrorKind::ClientError,
            _ => ErrorKind::Unknown,
        }
    }

    /// Classify from message text alone.
    pub fn classify_message(message: &str) -> ErrorKind {
        Self::classify(&ProviderError::Other(message.to_string()))
    }
}

fn contains_marker(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_lowercase();
    markers.iter().any(|marker| lower.contains(marker))
}

/// Which error kinds are worth retrying.
///
/// Defaults to treating `AuthError` and `ClientError` as permanent; a
/// deployment can widen or narrow that set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPolicy {
    permanent: HashSet<ErrorKind>,
}

impl ErrorPolicy {
    /// Build a policy from the set of kinds that must never be retried.
    pub fn with_permanent(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            permanent: kinds.into_iter().collect(),
        }
    }

    /// A policy that retries everything.
    pub fn retry_all() -> Self {
        Self {
            permanent: HashSet::new(),
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        !self.permanent.contains(&kind)
    }

    pub fn is_permanent(&self, kind: ErrorKind) -> bool {
        self.permanent.contains(&kind)
    }

    /// Kinds treated as permanent, in stable order.
    pub fn permanent_kinds(&self) -> Vec<ErrorKind> {
        let mut kinds: Vec<_> = self.permanent.iter().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::with_permanent([ErrorKind::AuthError, ErrorKind::ClientError])
    }
}
