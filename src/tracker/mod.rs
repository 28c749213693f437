//! Usage tracker: aggregates call outcomes into daily, per-API, per-user and
//! custom-metric statistics.
//!
//! All state lives behind one mutex. Snapshots are serialized under the lock
//! and written outside it; the on-disk copy lags the in-memory state by at
//! most one autosave period and is never consulted while the process runs.

mod export;
pub mod summary;
pub mod types;

pub use export::ExportFormat;

use crate::clock::{millis_to_utc, Clock, SystemClock};
use crate::config::{MonitorConfig, RetentionPolicy, SharedPolicy};
use crate::maintenance::{spawn_periodic, MaintenanceHandle};
use crate::store::{parse_entries, SnapshotStore};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use summary::{
    CustomMetricSummary, Overview, PerformanceDigest, RecentError, SessionOverview, StatsSummary,
    HealthStatus, StorageInfo, SystemHealth, TopApi, TrendPoint, UserActivityRecord,
};
use tracing::{debug, info, warn};
use types::{
    percent, round_to, ApiTypeStats, BoundedFifo, CustomMetric, DailyBucket, OutcomeCounts,
    TrackerMetadata, UserActivity, SESSION_LATENCY_CAPACITY,
};

const HOUR_MS: u64 = 3_600_000;
const TOP_API_COUNT: usize = 5;
const ERRORS_PER_API: usize = 5;
const RECENT_ERROR_COUNT: usize = 10;

/// Outcome of one external API call, as reported by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub api_type: String,
    pub user: Option<String>,
    pub success: bool,
    pub latency_ms: Option<f64>,
    pub error_message: Option<String>,
}

impl CallOutcome {
    /// A successful call with no user or latency attached.
    pub fn success(api_type: impl Into<String>) -> Self {
        Self { api_type: api_type.into(), user: None, success: true, latency_ms: None, error_message: None }
    }

    /// A failed call carrying its error message.
    pub fn failure(api_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            api_type: api_type.into(),
            user: None,
            success: false,
            latency_ms: None,
            error_message: Some(error_message.into()),
        }
    }

    pub fn by(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Attach the call latency.
    pub fn took(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_secs_f64() * 1_000.0);
        self
    }
}

/// In-process activity that is never persisted.
#[derive(Debug)]
struct SessionWindow {
    started_at_ms: u64,
    calls: u64,
    errors: u64,
    last_hour: VecDeque<u64>,
    active_users: BTreeSet<String>,
    response_times: BTreeMap<String, BoundedFifo<f64, SESSION_LATENCY_CAPACITY>>,
}

impl SessionWindow {
    fn new(now_ms: u64) -> Self {
        Self {
            started_at_ms: now_ms,
            calls: 0,
            errors: 0,
            last_hour: VecDeque::new(),
            active_users: BTreeSet::new(),
            response_times: BTreeMap::new(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(HOUR_MS);
        while self.last_hour.front().is_some_and(|ts| *ts <= cutoff) {
            self.last_hour.pop_front();
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    metadata: TrackerMetadata,
    daily_stats: BTreeMap<NaiveDate, DailyBucket>,
    api_types: BTreeMap<String, ApiTypeStats>,
    user_activity: BTreeMap<String, UserActivity>,
    custom_metrics: BTreeMap<String, CustomMetric>,
    // top-level snapshot keys this version does not know about
    extra: Map<String, Value>,
    session: SessionWindow,
    generation: u64,
}

#[derive(Serialize)]
struct TrackerDocument<'a> {
    metadata: &'a TrackerMetadata,
    daily_stats: &'a BTreeMap<NaiveDate, DailyBucket>,
    api_types: &'a BTreeMap<String, ApiTypeStats>,
    user_activity: &'a BTreeMap<String, UserActivity>,
    custom_metrics: &'a BTreeMap<String, CustomMetric>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

impl TrackerState {
    fn fresh(now_ms: u64) -> Self {
        Self {
            metadata: TrackerMetadata::fresh(millis_to_utc(now_ms)),
            daily_stats: BTreeMap::new(),
            api_types: BTreeMap::new(),
            user_activity: BTreeMap::new(),
            custom_metrics: BTreeMap::new(),
            extra: Map::new(),
            session: SessionWindow::new(now_ms),
            generation: 0,
        }
    }

    fn to_document(&self) -> Value {
        let doc = TrackerDocument {
            metadata: &self.metadata,
            daily_stats: &self.daily_stats,
            api_types: &self.api_types,
            user_activity: &self.user_activity,
            custom_metrics: &self.custom_metrics,
            extra: &self.extra,
        };
        serde_json::to_value(doc).unwrap_or_else(|e| {
            warn!(error = %e, "tracker snapshot serialization failed");
            Value::Null
        })
    }

    fn from_document(doc: Value, now_ms: u64) -> Self {
        let mut state = Self::fresh(now_ms);
        let Value::Object(mut doc) = doc else {
            return state;
        };
        if let Some(metadata) = doc.remove("metadata") {
            match serde_json::from_value(metadata) {
                Ok(metadata) => state.metadata = metadata,
                Err(e) => warn!(branch = "metadata", error = %e, "malformed snapshot branch replaced with default"),
            }
        }
        state.daily_stats =
            parse_entries(&mut doc, "daily_stats", |k| NaiveDate::parse_from_str(k, "%Y-%m-%d").ok());
        for (date, bucket) in state.daily_stats.iter_mut() {
            if bucket.normalize() {
                warn!(%date, "daily bucket totals repaired on load");
            }
        }
        state.api_types = parse_entries(&mut doc, "api_types", |k| Some(k.to_string()));
        state.user_activity = parse_entries(&mut doc, "user_activity", |k| Some(k.to_string()));
        state.custom_metrics = parse_entries(&mut doc, "custom_metrics", |k| Some(k.to_string()));
        state.extra = doc;
        state
    }
}

#[derive(Debug)]
struct TrackerInner {
    state: Mutex<TrackerState>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    retention: SharedPolicy<RetentionPolicy>,
    app_name: String,
    storage_dir: PathBuf,
    exports_dir: PathBuf,
    autosave_interval: Duration,
}

/// Records API call outcomes and answers summary queries.
///
/// Clones share the same state, so one tracker can be handed to every worker
/// and to the dashboard.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    inner: Arc<TrackerInner>,
}

impl UsageTracker {
    /// Open the tracker stored under `config.storage_path` using the system clock.
    pub fn open(config: &MonitorConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock (tests drive time through a [`crate::ManualClock`]).
    pub fn open_with_clock(config: &MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::open_with(config, clock, SharedPolicy::new(config.retention))
    }

    pub(crate) fn open_with(
        config: &MonitorConfig,
        clock: Arc<dyn Clock>,
        retention: SharedPolicy<RetentionPolicy>,
    ) -> Self {
        let now_ms = clock.now_millis();
        let store = SnapshotStore::new(config.stats_file());
        let fresh = TrackerState::fresh(now_ms);
        let existed = store.path().exists();
        let merged = store.load_merged(fresh.to_document());
        let state = TrackerState::from_document(merged, now_ms);
        info!(
            path = %store.path().display(),
            total_calls_ever = state.metadata.total_calls_ever,
            days = state.daily_stats.len(),
            "usage tracker loaded"
        );

        let tracker = Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(state),
                store,
                clock,
                retention,
                app_name: config.app_name.clone(),
                storage_dir: config.storage_path.clone(),
                exports_dir: config.exports_dir(),
                autosave_interval: config.autosave_interval(),
            }),
        };
        if !existed {
            tracker.snapshot_now();
        }
        tracker
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of `api_stats.json`.
    pub fn snapshot_path(&self) -> &Path {
        self.inner.store.path()
    }

    /// Replace the retention policy used by [`cleanup_old_data`](Self::cleanup_old_data).
    pub fn set_retention(&self, retention: RetentionPolicy) {
        self.inner.retention.store(retention);
    }

    /// Record one API call. Never fails; persistence happens on the autosave tick.
    pub fn record(
        &self,
        api_type: &str,
        user: Option<&str>,
        success: bool,
        latency_ms: Option<f64>,
        error_message: Option<&str>,
    ) {
        let latency_ms = match latency_ms {
            Some(latency) if !latency.is_finite() => {
                warn!(api_type, latency = %latency, "non-finite latency ignored");
                None
            }
            other => other,
        };
        let now_ms = self.inner.clock.now_millis();
        let now = millis_to_utc(now_ms);
        let today = self.inner.clock.today();
        {
            let mut state = self.lock();
            state.metadata.total_calls_ever += 1;

            state.daily_stats.entry(today).or_default().observe(api_type, user, success);

            state
                .api_types
                .entry(api_type.to_string())
                .or_insert_with(|| ApiTypeStats::first(now))
                .observe(now, user, success, latency_ms, error_message);

            if let Some(user) = user {
                state
                    .user_activity
                    .entry(user.to_string())
                    .or_insert_with(|| UserActivity::first(now))
                    .observe(now, api_type);
            }

            let session = &mut state.session;
            session.calls += 1;
            session.last_hour.push_back(now_ms);
            session.prune(now_ms);
            if let Some(user) = user {
                session.active_users.insert(user.to_string());
            }
            if !success && error_message.is_some() {
                session.errors += 1;
            }
            if let Some(latency) = latency_ms {
                session.response_times.entry(api_type.to_string()).or_default().push(latency);
            }
        }

        debug!(
            api_type,
            user = user.unwrap_or("-"),
            success,
            latency_ms = latency_ms.unwrap_or_default(),
            error = error_message.unwrap_or(""),
            "api call recorded"
        );
    }

    /// [`record`](Self::record) taking a [`CallOutcome`].
    pub fn record_outcome(&self, outcome: &CallOutcome) {
        self.record(
            &outcome.api_type,
            outcome.user.as_deref(),
            outcome.success,
            outcome.latency_ms,
            outcome.error_message.as_deref(),
        );
    }

    /// Record an application-defined measurement. `unit` defaults to `"count"`.
    ///
    /// Non-finite values are dropped with a warning.
    pub fn record_custom_metric(&self, name: &str, value: f64, unit: Option<&str>, user: Option<&str>) {
        if !value.is_finite() {
            warn!(metric = name, value = %value, "non-finite metric value ignored");
            return;
        }
        let now = self.inner.clock.now_utc();
        let today = self.inner.clock.today();
        let mut state = self.lock();
        state
            .custom_metrics
            .entry(name.to_string())
            .or_insert_with(|| CustomMetric::first(unit.unwrap_or("count"), value))
            .observe(now, today, value, user);
    }

    /// Calls recorded since the snapshot was first created, across restarts.
    pub fn total_calls_ever(&self) -> u64 {
        self.lock().metadata.total_calls_ever
    }

    /// The bucket for `date`, if any calls were recorded that day.
    pub fn daily_bucket(&self, date: NaiveDate) -> Option<DailyBucket> {
        self.lock().daily_stats.get(&date).cloned()
    }

    /// Lifetime statistics for one API type.
    pub fn api_type_stats(&self, api_type: &str) -> Option<ApiTypeStats> {
        self.lock().api_types.get(api_type).cloned()
    }

    /// Aggregates for one custom metric, if it was ever recorded.
    pub fn custom_metric(&self, name: &str) -> Option<CustomMetric> {
        self.lock().custom_metrics.get(name).cloned()
    }

    /// Summary of the last `days_back` days plus today.
    pub fn stats_summary(&self, days_back: u32) -> StatsSummary {
        let now_ms = self.inner.clock.now_millis();
        let today = self.inner.clock.today();
        let start = today.checked_sub_days(Days::new(u64::from(days_back))).unwrap_or(today);

        let mut state = self.lock();
        state.session.prune(now_ms);
        let state = &*state;

        let mut period_total = 0u64;
        let mut period_success = 0u64;
        let mut period_failed = 0u64;
        let mut unique_users = BTreeSet::new();
        let mut api_breakdown: BTreeMap<String, OutcomeCounts> = BTreeMap::new();
        let mut daily_trend = Vec::new();

        let mut date = start;
        while date <= today {
            match state.daily_stats.get(&date) {
                Some(bucket) => {
                    period_total += bucket.total_calls;
                    period_success += bucket.successful_calls;
                    period_failed += bucket.failed_calls;
                    unique_users.extend(bucket.unique_users.iter().cloned());
                    for (api_type, counts) in &bucket.api_breakdown {
                        api_breakdown.entry(api_type.clone()).or_default().merge(counts);
                    }
                    daily_trend.push(TrendPoint {
                        date,
                        calls: bucket.total_calls,
                        success_rate: bucket.success_rate(),
                    });
                }
                None => daily_trend.push(TrendPoint { date, calls: 0, success_rate: 0.0 }),
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        let mut top_apis: Vec<TopApi> = state
            .api_types
            .iter()
            .map(|(api_type, stats)| TopApi {
                api_type: api_type.clone(),
                total_calls: stats.total_calls,
                success_rate: stats.success_rate(),
                avg_response_time: stats.avg_response_time,
            })
            .collect();
        // stable sort keeps key order among ties
        top_apis.sort_by(|a, b| b.total_calls.cmp(&a.total_calls));
        top_apis.truncate(TOP_API_COUNT);

        let mut recent_errors: Vec<RecentError> = state
            .api_types
            .iter()
            .flat_map(|(api_type, stats)| {
                stats.recent_errors.newest(ERRORS_PER_API).map(move |e| RecentError {
                    api_type: api_type.clone(),
                    timestamp: e.timestamp,
                    message: e.message.clone(),
                    user: e.user.clone(),
                })
            })
            .collect();
        recent_errors.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent_errors.truncate(RECENT_ERROR_COUNT);

        let performance = state
            .session
            .response_times
            .iter()
            .filter(|(_, times)| !times.is_empty())
            .map(|(api_type, times)| {
                (
                    api_type.clone(),
                    PerformanceDigest {
                        avg_response_time: times.mean().unwrap_or_default(),
                        max_response_time: times.max().unwrap_or_default(),
                        min_response_time: times.min().unwrap_or_default(),
                        call_count: times.len(),
                    },
                )
            })
            .collect();

        let custom_metrics = state
            .custom_metrics
            .iter()
            .map(|(name, metric)| {
                (
                    name.clone(),
                    CustomMetricSummary {
                        current_average: round_to(metric.average, 2),
                        total_value: metric.total_value,
                        count: metric.count,
                        max_value: metric.max_value,
                        min_value: metric.min_value,
                        unit: metric.unit.clone(),
                    },
                )
            })
            .collect();

        let session = &state.session;
        StatsSummary {
            overview: Overview {
                total_calls_ever: state.metadata.total_calls_ever,
                period_calls: period_total,
                period_successful_calls: period_success,
                period_failed_calls: period_failed,
                today_calls: state.daily_stats.get(&today).map_or(0, |b| b.total_calls),
                success_rate: round_to(percent(period_success, period_total), 1),
                unique_users_period: unique_users.len(),
                api_types_count: state.api_types.len(),
            },
            session: SessionOverview {
                duration_minutes: round_to(now_ms.saturating_sub(session.started_at_ms) as f64 / 60_000.0, 1),
                calls_this_session: session.calls,
                errors_this_session: session.errors,
                active_users: session.active_users.len(),
                calls_last_hour: session.last_hour.len(),
            },
            api_breakdown,
            top_apis,
            daily_trend,
            recent_errors,
            performance,
            custom_metrics,
        }
    }

    /// Users ordered by most recent activity, at most `limit` of them.
    pub fn user_activity(&self, limit: usize) -> Vec<UserActivityRecord> {
        let now = self.inner.clock.now_utc();
        let state = self.lock();
        let mut users: Vec<UserActivityRecord> = state
            .user_activity
            .iter()
            .map(|(user, activity)| UserActivityRecord {
                user: user.clone(),
                first_seen: activity.first_seen,
                last_seen: activity.last_seen,
                total_calls: activity.total_calls,
                days_since_last_seen: (now - activity.last_seen).num_days(),
                api_usage: activity.api_usage.clone(),
            })
            .collect();
        users.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        users.truncate(limit);
        users
    }

    /// Health classification over the last day.
    pub fn system_health(&self) -> SystemHealth {
        let summary = self.stats_summary(1);
        let error_rate = percent(summary.overview.period_failed_calls, summary.overview.period_calls);
        let avg_response_time = if summary.performance.is_empty() {
            0.0
        } else {
            summary.performance.values().map(|p| p.avg_response_time).sum::<f64>()
                / summary.performance.len() as f64
        };
        SystemHealth {
            status: HealthStatus::classify(error_rate, avg_response_time),
            error_rate: round_to(error_rate, 2),
            avg_response_time: avg_response_time.round(),
            calls_last_24h: summary.overview.period_calls,
            active_users: summary.session.active_users,
            storage: StorageInfo::scan(&self.inner.storage_dir),
        }
    }

    /// Drop daily buckets (and custom-metric daily values) older than the
    /// retention window, then snapshot. Returns the number of buckets removed.
    pub fn cleanup_old_data(&self) -> usize {
        let retention = self.inner.retention.load();
        if !retention.auto_cleanup {
            debug!("cleanup skipped; auto_cleanup disabled");
            return 0;
        }
        let today = self.inner.clock.today();
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(retention.retention_days)))
            .unwrap_or(NaiveDate::MIN);

        let removed = {
            let mut state = self.lock();
            let before = state.daily_stats.len();
            state.daily_stats.retain(|date, _| *date >= cutoff);
            for metric in state.custom_metrics.values_mut() {
                metric.daily_values.retain(|date, _| *date >= cutoff);
            }
            before - state.daily_stats.len()
        };
        self.snapshot_now();
        info!(removed, %cutoff, "tracker cleanup completed");
        removed
    }

    /// Serialize the current state and write it atomically. Returns whether
    /// the snapshot reached disk; failures are logged, never raised.
    pub fn snapshot_now(&self) -> bool {
        let (doc, generation) = {
            let mut state = self.lock();
            state.metadata.last_updated = self.inner.clock.now_utc();
            state.generation += 1;
            (state.to_document(), state.generation)
        };
        match self.inner.store.save_generation(&doc, generation) {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "tracker snapshot failed; in-memory state kept");
                false
            }
        }
    }

    /// Start the periodic autosave loop on the current tokio runtime.
    pub fn spawn_autosave(&self) -> MaintenanceHandle {
        let tracker = self.clone();
        spawn_periodic("tracker-autosave", self.inner.autosave_interval, move || {
            tracker.snapshot_now();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker_in(dir: &Path, clock: &ManualClock) -> UsageTracker {
        let config = MonitorConfig::new("test", dir);
        UsageTracker::open_with_clock(&config, Arc::new(clock.clone()))
    }

    #[test]
    fn record_updates_every_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);

        tracker.record("upload", Some("a@x.io"), true, Some(120.0), None);
        tracker.record("upload", Some("b@x.io"), false, None, Some("quota exceeded"));
        tracker.record("auth", None, true, None, None);

        let bucket = tracker.daily_bucket(clock.today()).unwrap();
        assert_eq!(bucket.total_calls, 3);
        assert_eq!(bucket.successful_calls + bucket.failed_calls, bucket.total_calls);
        assert_eq!(bucket.unique_users.len(), 2);
        assert_eq!(bucket.api_breakdown["upload"], OutcomeCounts { success: 1, error: 1 });

        let upload = tracker.api_type_stats("upload").unwrap();
        assert_eq!(upload.response_times.len(), 1);
        assert_eq!(upload.recent_errors.len(), 1);
        assert_eq!(tracker.total_calls_ever(), 3);
    }

    #[test]
    fn response_times_keep_latest_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        for i in 0..150 {
            tracker.record("sheets", None, true, Some(f64::from(i)), None);
        }
        let stats = tracker.api_type_stats("sheets").unwrap();
        let kept: Vec<f64> = stats.response_times.iter().copied().collect();
        assert_eq!(kept, (50..150).map(f64::from).collect::<Vec<_>>());
        assert_eq!(stats.avg_response_time, 99.5);
        assert_eq!(stats.max_response_time, 149.0);
    }

    #[test]
    fn summary_fills_gaps_and_ranks_apis() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);

        for api in ["a", "b", "c", "d", "e", "f"] {
            tracker.record(api, None, true, None, None);
        }
        tracker.record("f", None, true, None, None);

        let summary = tracker.stats_summary(7);
        assert_eq!(summary.daily_trend.len(), 8);
        assert!(summary.daily_trend[..7].iter().all(|p| p.calls == 0 && p.success_rate == 0.0));
        assert_eq!(summary.daily_trend[7].calls, 7);

        let ranked: Vec<&str> = summary.top_apis.iter().map(|t| t.api_type.as_str()).collect();
        assert_eq!(ranked, vec!["f", "a", "b", "c", "d"]);
    }

    #[test]
    fn recent_errors_are_newest_first_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        for i in 0..8 {
            clock.advance(Duration::from_secs(1));
            tracker.record("upload", None, false, None, Some(&format!("u{i}")));
            tracker.record("auth", None, false, None, Some(&format!("a{i}")));
        }
        let errors = tracker.stats_summary(1).recent_errors;
        assert_eq!(errors.len(), 10);
        assert!(errors.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert!(errors.iter().any(|e| e.message == "u7"));
        assert!(errors.iter().all(|e| e.message != "u0"));
    }

    #[test]
    fn health_is_critical_above_ten_percent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        for _ in 0..8 {
            tracker.record("upload", None, true, Some(50.0), None);
        }
        tracker.record("upload", None, false, None, Some("boom"));
        tracker.record("upload", None, false, None, Some("boom"));

        let health = tracker.system_health();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(health.error_rate, 20.0);
        assert_eq!(health.avg_response_time, 50.0);
        assert_eq!(health.calls_last_24h, 10);
        assert!(health.storage.is_some());
    }

    #[test]
    fn slow_calls_raise_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        tracker.record("render", None, true, Some(7_500.0), None);
        assert_eq!(tracker.system_health().status, HealthStatus::Warning);
    }

    #[test]
    fn custom_metric_defaults_unit() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        tracker.record_custom_metric("videos_rendered", 1.0, None, None);
        tracker.record_custom_metric("videos_rendered", 2.0, Some("ignored"), Some("u"));
        let metric = tracker.custom_metric("videos_rendered").unwrap();
        assert_eq!(metric.unit, "count");
        assert_eq!(metric.count, 2);
        assert_eq!(metric.recent_values.len(), 2);
        let summary = tracker.stats_summary(0);
        assert_eq!(summary.custom_metrics["videos_rendered"].current_average, 1.5);
    }

    #[test]
    fn user_activity_sorted_by_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        tracker.record("auth", Some("old@x.io"), true, None, None);
        clock.advance(Duration::from_secs(3 * 86_400));
        tracker.record("auth", Some("new@x.io"), true, None, None);

        let users = tracker.user_activity(50);
        assert_eq!(users[0].user, "new@x.io");
        assert_eq!(users[1].days_since_last_seen, 3);
        assert_eq!(tracker.user_activity(1).len(), 1);
    }

    #[test]
    fn session_counts_calls_in_last_hour() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::from_system();
        let tracker = tracker_in(dir.path(), &clock);
        tracker.record("auth", Some("u"), true, None, None);
        clock.advance(Duration::from_secs(3_601));
        tracker.record("auth", Some("u"), true, None, None);
        let session = tracker.stats_summary(1).session;
        assert_eq!(session.calls_this_session, 2);
        assert_eq!(session.calls_last_hour, 1);
        assert_eq!(session.active_users, 1);
        assert_eq!(session.duration_minutes, 60.0);
    }
}
