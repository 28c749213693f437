//! Policy and storage configuration.
//!
//! The host application owns config loading; this module only defines the
//! typed shape it deserializes into and the live policy handle both
//! components read from.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// API type whose entry doubles as the fallback for unknown types.
pub const FALLBACK_API_TYPE: &str = "api_call";

/// Sliding-window budget for one API type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_calls: u32,
    pub window_minutes: u32,
}

impl RateLimitPolicy {
    /// Validated constructor.
    pub fn new(max_calls: u32, window_minutes: u32) -> Result<Self, ConfigError> {
        let policy = Self { max_calls, window_minutes };
        policy.validate(FALLBACK_API_TYPE)?;
        Ok(policy)
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_minutes) * 60)
    }

    fn validate(&self, api_type: &str) -> Result<(), ConfigError> {
        if self.max_calls == 0 {
            return Err(ConfigError::ZeroMaxCalls { api_type: api_type.to_string() });
        }
        if self.window_minutes == 0 {
            return Err(ConfigError::ZeroWindow { api_type: api_type.to_string() });
        }
        Ok(())
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self { max_calls: 100, window_minutes: 60 }
    }
}

/// Per-API-type rate limits with an explicit fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub default_limits: BTreeMap<String, RateLimitPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut default_limits = BTreeMap::new();
        default_limits.insert("debug_upload".to_string(), RateLimitPolicy { max_calls: 3, window_minutes: 60 });
        default_limits.insert("auth_operation".to_string(), RateLimitPolicy { max_calls: 10, window_minutes: 60 });
        default_limits.insert(FALLBACK_API_TYPE.to_string(), RateLimitPolicy::default());
        Self { default_limits }
    }
}

impl PolicyTable {
    /// Budget for `api_type`, falling back to the `api_call` entry and then to
    /// `{100 calls / 60 minutes}`.
    pub fn policy_for(&self, api_type: &str) -> RateLimitPolicy {
        self.default_limits
            .get(api_type)
            .or_else(|| self.default_limits.get(FALLBACK_API_TYPE))
            .copied()
            .unwrap_or_default()
    }

    /// Insert or replace the budget for one API type.
    pub fn with_limit(mut self, api_type: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.default_limits.insert(api_type.into(), policy);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_limits.iter().try_for_each(|(api_type, policy)| policy.validate(api_type))
    }
}

/// How long daily buckets are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub auto_cleanup: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { retention_days: 30, auto_cleanup: true }
    }
}

/// Threshold for automatically blocking a user who keeps hitting limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbusePolicy {
    pub denials_threshold: u32,
    pub window_minutes: u32,
    pub block_minutes: u32,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        Self { denials_threshold: 5, window_minutes: 10, block_minutes: 60 }
    }
}

/// Top-level configuration for a [`crate::Monitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub app_name: String,
    pub storage_path: PathBuf,
    pub rate_limits: PolicyTable,
    pub retention: RetentionPolicy,
    pub abuse: AbusePolicy,
    pub autosave_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            app_name: "apiwatch".to_string(),
            storage_path: PathBuf::from("monitoring_data"),
            rate_limits: PolicyTable::default(),
            retention: RetentionPolicy::default(),
            abuse: AbusePolicy::default(),
            autosave_interval_secs: 30,
            cleanup_interval_secs: 3_600,
        }
    }
}

impl MonitorConfig {
    pub fn new(app_name: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        Self { app_name: app_name.into(), storage_path: storage_path.into(), ..Self::default() }
    }

    /// Replace the per-API limits.
    pub fn with_rate_limits(mut self, rate_limits: PolicyTable) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_abuse(mut self, abuse: AbusePolicy) -> Self {
        self.abuse = abuse;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limits.validate()?;
        if self.autosave_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval { name: "autosave_interval_secs" });
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroInterval { name: "cleanup_interval_secs" });
        }
        if self.abuse.window_minutes == 0 {
            return Err(ConfigError::ZeroInterval { name: "abuse.window_minutes" });
        }
        Ok(())
    }

    /// Location of the tracker snapshot.
    pub fn stats_file(&self) -> PathBuf {
        self.storage_path.join("api_stats.json")
    }

    /// Location of the limiter snapshot.
    pub fn rate_limits_file(&self) -> PathBuf {
        self.storage_path.join("rate_limits.json")
    }

    /// Directory exports are written into.
    pub fn exports_dir(&self) -> PathBuf {
        self.storage_path.join("exports")
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Live-updatable handle to a policy value shared by both components.
///
/// Default backend is `ArcSwap` for lock-free reads on the admission hot
/// path; feature `adaptive-rwlock` switches to `RwLock`.
#[derive(Debug)]
pub struct SharedPolicy<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for SharedPolicy<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> SharedPolicy<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Current value; cheap `Arc` clone.
    pub fn load(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            match self.inner.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    /// Replace the value; readers see it on their next `load`.
    pub fn store(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            match self.inner.write() {
                Ok(mut guard) => *guard = Arc::new(value),
                Err(poisoned) => *poisoned.into_inner() = Arc::new(value),
            }
        }
    }

    /// Derive a new value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.load();
        self.store(f(&current));
    }
}
