//! One tracker and one limiter built from a single [`MonitorConfig`].

use crate::clock::{Clock, SystemClock};
use crate::config::{AbusePolicy, MonitorConfig, PolicyTable, RetentionPolicy, SharedPolicy};
use crate::error::{ConfigError, RateLimitExceeded};
use crate::limiter::RateLimiter;
use crate::maintenance::MaintenanceHandle;
use crate::tracker::summary::StorageInfo;
use crate::tracker::UsageTracker;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Entry point for host applications.
///
/// Construct one at startup and hand clones to whoever needs it; clones share
/// the tracker, the limiter and the live policy handles.
///
/// ```no_run
/// use apiwatch::{Monitor, MonitorConfig};
///
/// # async fn run() -> Result<(), apiwatch::ConfigError> {
/// let monitor = Monitor::open(MonitorConfig::new("uploader", "monitoring_data"))?;
/// monitor.start_maintenance();
///
/// if monitor.check("debug_upload", Some("user@example.com"), None).is_ok() {
///     // ... perform the upload ...
///     monitor.tracker().record("debug_upload", Some("user@example.com"), true, Some(840.0), None);
/// }
///
/// monitor.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Monitor {
    config: Arc<MonitorConfig>,
    tracker: UsageTracker,
    limiter: RateLimiter,
    policies: SharedPolicy<PolicyTable>,
    retention: SharedPolicy<RetentionPolicy>,
    abuse: SharedPolicy<AbusePolicy>,
    tasks: Arc<Mutex<Vec<MaintenanceHandle>>>,
}

impl Monitor {
    /// Validate `config` and load both components from its storage path.
    pub fn open(config: MonitorConfig) -> Result<Self, ConfigError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`open`](Self::open), with both components reading `clock`.
    pub fn open_with_clock(config: MonitorConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        let policies = SharedPolicy::new(config.rate_limits.clone());
        let retention = SharedPolicy::new(config.retention);
        let abuse = SharedPolicy::new(config.abuse);
        let tracker = UsageTracker::open_with(&config, clock.clone(), retention.clone());
        let limiter = RateLimiter::open_with(&config, clock, policies.clone(), abuse.clone());
        info!(app = %config.app_name, storage = %config.storage_path.display(), "monitor opened");
        Ok(Self {
            config: Arc::new(config),
            tracker,
            limiter,
            policies,
            retention,
            abuse,
            tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The usage tracker. Clone it to hand to worker threads.
    pub fn tracker(&self) -> &UsageTracker {
        &self.tracker
    }

    /// The rate limiter. Clone it to hand to worker threads.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn storage_path(&self) -> &Path {
        &self.config.storage_path
    }

    /// Admission check against the live policy table.
    pub fn check(&self, api_type: &str, user: Option<&str>, address: Option<&str>) -> Result<(), RateLimitExceeded> {
        self.limiter.check(api_type, user, address)
    }

    /// Swap the rate-limit table after validating it.
    pub fn set_policies(&self, table: PolicyTable) -> Result<(), ConfigError> {
        table.validate()?;
        self.policies.store(table);
        info!("rate limit policies updated");
        Ok(())
    }

    /// Swap the retention policy; the next cleanup uses it.
    pub fn set_retention(&self, retention: RetentionPolicy) {
        self.retention.store(retention);
    }

    /// Validate and swap the abuse policy used for automatic blocks.
    pub fn set_abuse_policy(&self, abuse: AbusePolicy) -> Result<(), ConfigError> {
        if abuse.window_minutes == 0 {
            return Err(ConfigError::ZeroInterval { name: "abuse.window_minutes" });
        }
        self.abuse.store(abuse);
        Ok(())
    }

    /// Start the tracker autosave and limiter cleanup loops. A second call
    /// while they run is a no-op. Must be called inside a tokio runtime.
    pub fn start_maintenance(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }
        tasks.push(self.tracker.spawn_autosave());
        tasks.push(self.limiter.spawn_cleanup());
    }

    /// Number of maintenance loops currently owned.
    pub fn maintenance_tasks(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stop maintenance and write final snapshots of both components.
    pub async fn shutdown(&self) {
        let tasks: Vec<MaintenanceHandle> =
            std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.shutdown().await;
        }
        self.tracker.snapshot_now();
        self.limiter.snapshot_now();
        info!(app = %self.config.app_name, "monitor shut down");
    }

    /// Disk usage of the storage directory, `None` when it cannot be read.
    pub fn storage_info(&self) -> Option<StorageInfo> {
        StorageInfo::scan(&self.config.storage_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitPolicy;

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MonitorConfig::new("t", dir.path());
        config.autosave_interval_secs = 0;
        assert_eq!(
            Monitor::open(config).unwrap_err(),
            ConfigError::ZeroInterval { name: "autosave_interval_secs" }
        );
    }

    #[test]
    fn policy_swap_reaches_the_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_at(1_700_000_000_000));
        let monitor = Monitor::open_with_clock(MonitorConfig::new("t", dir.path()), clock).unwrap();
        monitor.check("upload", Some("u"), None).unwrap();

        let table = PolicyTable::default().with_limit("upload", RateLimitPolicy { max_calls: 1, window_minutes: 5 });
        monitor.set_policies(table).unwrap();
        assert!(monitor.check("upload", Some("u"), None).is_err());

        let bad = PolicyTable::default().with_limit("upload", RateLimitPolicy { max_calls: 0, window_minutes: 5 });
        assert!(monitor.set_policies(bad).is_err());
    }

    #[test]
    fn storage_info_sees_both_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::open(MonitorConfig::new("t", dir.path())).unwrap();
        let info = monitor.storage_info().unwrap();
        assert_eq!(info.file_count, 2);
        assert!(info.total_size_bytes > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_starts_once_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::open(MonitorConfig::new("t", dir.path())).unwrap();
        monitor.start_maintenance();
        monitor.start_maintenance();
        assert_eq!(monitor.maintenance_tasks(), 2);
        monitor.shutdown().await;
        assert_eq!(monitor.maintenance_tasks(), 0);
    }
}
