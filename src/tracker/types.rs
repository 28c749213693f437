//! Aggregates owned by the usage tracker.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Most recent latencies kept per API type.
pub const RESPONSE_TIME_CAPACITY: usize = 100;
/// Most recent errors kept per API type.
pub const RECENT_ERROR_CAPACITY: usize = 20;
/// Most recent samples kept per custom metric.
pub const METRIC_SAMPLE_CAPACITY: usize = 100;
/// Latencies kept per API type for the in-process performance digest.
pub const SESSION_LATENCY_CAPACITY: usize = 1_000;

/// Fixed-capacity FIFO that drops its oldest element on overflow.
///
/// Serialized as a plain JSON array; deserializing keeps the newest `N`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedFifo<T, const N: usize> {
    items: VecDeque<T>,
}

impl<T, const N: usize> Default for BoundedFifo<T, N> {
    fn default() -> Self {
        Self { items: VecDeque::new() }
    }
}

impl<T, const N: usize> BoundedFifo<T, N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of retained items.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Append `item`, evicting the oldest one when full.
    pub fn push(&mut self, item: T) {
        self.items.push_back(item);
        while self.items.len() > N {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The newest `n` items, oldest first.
    pub fn newest(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }
}

impl<const N: usize> BoundedFifo<f64, N> {
    /// Arithmetic mean, or `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.iter().sum::<f64>() / self.items.len() as f64)
        }
    }

    pub fn max(&self) -> Option<f64> {
        self.items.iter().copied().reduce(f64::max)
    }

    pub fn min(&self) -> Option<f64> {
        self.items.iter().copied().reduce(f64::min)
    }
}

impl<T, const N: usize> FromIterator<T> for BoundedFifo<T, N> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut fifo = Self::new();
        iter.into_iter().for_each(|item| fifo.push(item));
        fifo
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedFifo<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.items.len()))?;
        for item in &self.items {
            seq.serialize_element(item)?;
        }
        seq.end()
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedFifo<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(items.into_iter().collect())
    }
}

/// Success/error tally for one API type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutcomeCounts {
    pub success: u64,
    pub error: u64,
}

impl OutcomeCounts {
    /// Count one outcome.
    pub fn add(&mut self, success: bool) {
        if success {
            self.success += 1;
        } else {
            self.error += 1;
        }
    }

    /// Add `other`'s counts to these.
    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.success += other.success;
        self.error += other.error;
    }
}

/// Calls recorded on one local calendar day.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DailyBucket {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub unique_users: BTreeSet<String>,
    pub api_breakdown: BTreeMap<String, OutcomeCounts>,
}

impl DailyBucket {
    pub(crate) fn observe(&mut self, api_type: &str, user: Option<&str>, success: bool) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        if let Some(user) = user {
            self.unique_users.insert(user.to_string());
        }
        self.api_breakdown.entry(api_type.to_string()).or_default().add(success);
    }

    /// Restore `total == successful + failed` on a hand-edited or torn snapshot.
    pub(crate) fn normalize(&mut self) -> bool {
        let expected = self.successful_calls + self.failed_calls;
        let changed = self.total_calls != expected;
        self.total_calls = expected;
        changed
    }

    pub fn success_rate(&self) -> f64 {
        percent(self.successful_calls, self.total_calls)
    }
}

/// One failed call kept for the dashboard.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// Lifetime counters for one API type.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ApiTypeStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_response_time: f64,
    pub max_response_time: f64,
    pub response_times: BoundedFifo<f64, RESPONSE_TIME_CAPACITY>,
    pub recent_errors: BoundedFifo<ErrorRecord, RECENT_ERROR_CAPACITY>,
}

impl ApiTypeStats {
    pub(crate) fn first(now: DateTime<Utc>) -> Self {
        Self { first_seen: now, last_seen: now, ..Self::default() }
    }

    pub(crate) fn observe(
        &mut self,
        now: DateTime<Utc>,
        user: Option<&str>,
        success: bool,
        latency_ms: Option<f64>,
        error_message: Option<&str>,
    ) {
        self.total_calls += 1;
        self.last_seen = now;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
            if let Some(message) = error_message {
                self.recent_errors.push(ErrorRecord {
                    timestamp: now,
                    message: message.to_string(),
                    user: user.map(str::to_string),
                });
            }
        }
        if let Some(latency) = latency_ms {
            self.response_times.push(latency);
            self.avg_response_time = self.response_times.mean().unwrap_or_default();
            self.max_response_time = self.response_times.max().unwrap_or_default();
        }
    }

    pub fn success_rate(&self) -> f64 {
        percent(self.successful_calls, self.total_calls)
    }
}

/// Lifetime activity of one user.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UserActivity {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_calls: u64,
    pub api_usage: BTreeMap<String, u64>,
}

impl UserActivity {
    pub(crate) fn first(now: DateTime<Utc>) -> Self {
        Self { first_seen: now, last_seen: now, ..Self::default() }
    }

    pub(crate) fn observe(&mut self, now: DateTime<Utc>, api_type: &str) {
        self.last_seen = now;
        self.total_calls += 1;
        *self.api_usage.entry(api_type.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub user: Option<String>,
}

/// Application-defined measurement, e.g. render seconds or upload bytes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CustomMetric {
    pub unit: String,
    pub total_value: f64,
    pub count: u64,
    pub average: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub daily_values: BTreeMap<NaiveDate, Vec<f64>>,
    pub recent_values: BoundedFifo<MetricSample, METRIC_SAMPLE_CAPACITY>,
}

impl Default for CustomMetric {
    fn default() -> Self {
        Self::first("count", 0.0)
    }
}

impl CustomMetric {
    pub(crate) fn first(unit: &str, value: f64) -> Self {
        Self {
            unit: unit.to_string(),
            total_value: 0.0,
            count: 0,
            average: 0.0,
            min_value: value,
            max_value: value,
            daily_values: BTreeMap::new(),
            recent_values: BoundedFifo::new(),
        }
    }

    pub(crate) fn observe(&mut self, now: DateTime<Utc>, today: NaiveDate, value: f64, user: Option<&str>) {
        self.total_value += value;
        self.count += 1;
        self.average = self.total_value / self.count as f64;
        self.max_value = self.max_value.max(value);
        self.min_value = self.min_value.min(value);
        self.daily_values.entry(today).or_default().push(value);
        self.recent_values.push(MetricSample { timestamp: now, value, user: user.map(str::to_string) });
    }
}

/// The `metadata` block of the tracker snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackerMetadata {
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub total_calls_ever: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TrackerMetadata {
    pub(crate) fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            last_updated: now,
            version: crate::store::SNAPSHOT_VERSION.to_string(),
            total_calls_ever: 0,
            extra: Map::new(),
        }
    }
}

/// `part / whole * 100`, or 0 for an empty whole.
pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
