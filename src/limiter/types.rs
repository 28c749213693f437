use crate::clock::millis_to_utc;
use crate::error::RateLimitExceeded;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Stage of the admission pipeline that rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Blocked,
    User,
    Address,
    Global,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Blocked => "blocked",
            Tier::User => "user",
            Tier::Address => "address",
            Tier::Global => "global",
        })
    }
}

/// The decision returned by [`crate::RateLimiter::is_rate_limited`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The call may proceed; its timestamp has been committed to every tier.
    Allowed,
    /// The call is rejected.
    Denied {
        tier: Tier,
        /// Reason for denial, e.g. `"Rate limit exceeded for upload"`.
        reason: String,
        /// How long the caller should wait before retrying.
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the call was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn is_limited(&self) -> bool {
        !self.is_allowed()
    }

    /// `"OK"` when allowed.
    pub fn reason(&self) -> &str {
        match self {
            Decision::Allowed => "OK",
            Decision::Denied { reason, .. } => reason,
        }
    }

    /// The tier that rejected the call, if any.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            Decision::Allowed => None,
            Decision::Denied { tier, .. } => Some(*tier),
        }
    }

    /// How long until the rejecting tier frees a slot. Zero when allowed.
    pub fn retry_after(&self) -> Duration {
        match self {
            Decision::Allowed => Duration::ZERO,
            Decision::Denied { retry_after, .. } => *retry_after,
        }
    }

    /// Convert a denial into the typed error returned by [`crate::RateLimiter::check`].
    pub fn into_result(self) -> Result<(), RateLimitExceeded> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied { reason, retry_after, .. } => Err(RateLimitExceeded::new(reason, retry_after)),
        }
    }
}

/// An explicit block on one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    /// Epoch milliseconds; the block is lifted once `now >= until_ms`.
    pub until_ms: u64,
}

impl BlockEntry {
    /// Expiry of the block as a UTC timestamp.
    pub fn until(&self) -> DateTime<Utc> {
        millis_to_utc(self.until_ms)
    }

    /// Whether the block is still in force at `now_ms`.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.until_ms
    }
}

/// A user's standing against one API type's budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRateInfo {
    pub api_type: String,
    pub max_calls: u32,
    pub window_minutes: u32,
    pub calls_made: usize,
    pub calls_remaining: usize,
    /// When the oldest call in the window ages out; `None` with no calls.
    pub reset_at: Option<DateTime<Utc>>,
    pub reset_in_seconds: u64,
}

/// Limiter-wide view for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub active_users_last_hour: usize,
    pub active_addresses_last_hour: usize,
    pub blocked_users: usize,
    pub blocked_user_list: Vec<String>,
    /// Calls per API type in the last hour, summed over user logs.
    pub api_usage_last_hour: BTreeMap<String, usize>,
    pub total_users_tracked: usize,
    pub total_addresses_tracked: usize,
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub timestamps_removed: usize,
    pub logs_removed: usize,
    pub blocks_expired: usize,
    pub users_remaining: usize,
    pub addresses_remaining: usize,
}

/// The `metadata` block of the limiter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterMetadata {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_cleanup: DateTime<Utc>,
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LimiterMetadata {
    pub(crate) fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            last_updated: now,
            last_cleanup: now,
            version: crate::store::SNAPSHOT_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_converts_to_error() {
        let decision = Decision::Denied {
            tier: Tier::User,
            reason: "Rate limit exceeded for upload".into(),
            retry_after: Duration::from_secs(90),
        };
        assert!(decision.is_limited());
        assert_eq!(decision.tier(), Some(Tier::User));
        let err = decision.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Rate limit exceeded for upload (retry in 1 minutes)");
    }

    #[test]
    fn allowed_reads_ok() {
        assert_eq!(Decision::Allowed.reason(), "OK");
        assert_eq!(Decision::Allowed.retry_after(), Duration::ZERO);
        assert!(Decision::Allowed.into_result().is_ok());
    }

    #[test]
    fn block_expires_at_until() {
        let entry = BlockEntry { reason: "spam".into(), blocked_at: millis_to_utc(0), until_ms: 1_000 };
        assert!(entry.is_active(999));
        assert!(!entry.is_active(1_000));
    }
}
