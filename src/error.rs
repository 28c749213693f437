//! Error types surfaced by the tracker, the limiter and the snapshot store.
//!
//! Only [`RateLimitExceeded`] is meant to be branched on by callers. Store
//! errors are logged and absorbed at the component boundary.
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A call was rejected by the admission pipeline.
///
/// Always recoverable: retry after [`RateLimitExceeded::retry_after`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitExceeded {
    /// Human readable reason, e.g. `"Rate limit exceeded for upload"`.
    pub reason: String,
    /// How long the caller should wait before retrying.
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    pub fn new(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self { reason: reason.into(), retry_after }
    }

    /// Whole seconds to wait, rounded up so "0 seconds" is never shown for a pending wait.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl fmt::Display for RateLimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.retry_after_secs();
        if secs == 0 {
            write!(f, "{}", self.reason)
        } else if secs > 60 {
            write!(f, "{} (retry in {} minutes)", self.reason, secs / 60)
        } else {
            write!(f, "{} (retry in {} seconds)", self.reason, secs)
        }
    }
}

impl std::error::Error for RateLimitExceeded {}

/// Snapshot load/save failure. Never crosses a component boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot JSON failed for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Invalid monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_calls must be > 0 (api type '{api_type}')")]
    ZeroMaxCalls { api_type: String },
    #[error("window_minutes must be > 0 (api type '{api_type}')")]
    ZeroWindow { api_type: String },
    #[error("{name} must be > 0")]
    ZeroInterval { name: &'static str },
}

/// Error returned by services wrapped in a [`crate::guard::GuardLayer`].
#[derive(Debug, Clone, Error)]
pub enum GuardError<E> {
    /// Admission denied before the inner call ran.
    #[error(transparent)]
    RateLimited(RateLimitExceeded),
    /// The wrapped call failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    /// Returns true if the limiter rejected the call.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Retry hint when the call was rate limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner service error, if the call got that far.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_seconds_under_a_minute() {
        let err = RateLimitExceeded::new("Rate limit exceeded for upload", Duration::from_millis(41_200));
        assert_eq!(err.to_string(), "Rate limit exceeded for upload (retry in 42 seconds)");
    }

    #[test]
    fn display_switches_to_minutes() {
        let err = RateLimitExceeded::new("User blocked: spam", Duration::from_secs(3_600));
        assert_eq!(err.to_string(), "User blocked: spam (retry in 60 minutes)");
    }

    #[test]
    fn display_omits_zero_wait() {
        let err = RateLimitExceeded::new("denied", Duration::ZERO);
        assert_eq!(err.to_string(), "denied");
    }

    #[test]
    fn guard_error_accessors() {
        let limited: GuardError<std::io::Error> =
            GuardError::RateLimited(RateLimitExceeded::new("x", Duration::from_secs(3)));
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert!(limited.into_inner().is_none());

        let inner = GuardError::Inner(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!inner.is_rate_limited());
        assert_eq!(inner.to_string(), "boom");
    }
}
