//! Read-only views handed to dashboards and exports.

use super::types::OutcomeCounts;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Aggregate answer to "what happened over the last N days?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    pub overview: Overview,
    pub session: SessionOverview,
    pub api_breakdown: BTreeMap<String, OutcomeCounts>,
    pub top_apis: Vec<TopApi>,
    pub daily_trend: Vec<TrendPoint>,
    pub recent_errors: Vec<RecentError>,
    pub performance: BTreeMap<String, PerformanceDigest>,
    pub custom_metrics: BTreeMap<String, CustomMetricSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub total_calls_ever: u64,
    pub period_calls: u64,
    pub period_successful_calls: u64,
    pub period_failed_calls: u64,
    pub today_calls: u64,
    /// Percent, one decimal.
    pub success_rate: f64,
    pub unique_users_period: usize,
    pub api_types_count: usize,
}

/// Activity since this process started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOverview {
    pub duration_minutes: f64,
    pub calls_this_session: u64,
    pub errors_this_session: u64,
    pub active_users: usize,
    pub calls_last_hour: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopApi {
    pub api_type: String,
    pub total_calls: u64,
    pub success_rate: f64,
    pub avg_response_time: f64,
}

/// One day of the trend series; days without calls are zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub calls: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentError {
    pub api_type: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub user: Option<String>,
}

/// Latency digest from the in-process session window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceDigest {
    pub avg_response_time: f64,
    pub max_response_time: f64,
    pub min_response_time: f64,
    pub call_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomMetricSummary {
    pub current_average: f64,
    pub total_value: f64,
    pub count: u64,
    pub max_value: f64,
    pub min_value: f64,
    pub unit: String,
}

/// Dashboard row for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserActivityRecord {
    pub user: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub total_calls: u64,
    pub days_since_last_seen: i64,
    pub api_usage: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// Thresholds: error rate above 10% is critical; above 5%, or average
    /// latency above 5 s, is a warning.
    pub fn classify(error_rate: f64, avg_response_time_ms: f64) -> Self {
        if error_rate > 10.0 {
            HealthStatus::Critical
        } else if error_rate > 5.0 || avg_response_time_ms > 5_000.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Percent, two decimals.
    pub error_rate: f64,
    /// Milliseconds, rounded.
    pub avg_response_time: f64,
    pub calls_last_24h: u64,
    pub active_users: usize,
    pub storage: Option<StorageInfo>,
}

/// Disk usage of the monitor's storage directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageInfo {
    pub storage_path: PathBuf,
    pub total_size_bytes: u64,
    pub total_size_mb: f64,
    pub file_count: usize,
}

impl StorageInfo {
    /// Walk `dir` recursively. Returns `None` if the directory is unreadable.
    pub fn scan(dir: &Path) -> Option<Self> {
        let mut total_size_bytes = 0u64;
        let mut file_count = 0usize;
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = match fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(e) if current == dir => {
                    tracing::debug!(path = %dir.display(), error = %e, "storage scan failed");
                    return None;
                }
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let Ok(meta) = entry.metadata() else { continue };
                if meta.is_dir() {
                    pending.push(entry.path());
                } else if meta.is_file() {
                    total_size_bytes += meta.len();
                    file_count += 1;
                }
            }
        }
        Some(Self {
            storage_path: dir.to_path_buf(),
            total_size_bytes,
            total_size_mb: super::types::round_to(total_size_bytes as f64 / (1024.0 * 1024.0), 2),
            file_count,
        })
    }
}
