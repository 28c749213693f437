#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # apiwatch
//!
//! Embedded usage accounting and abuse throttling for applications that call
//! external network APIs.
//!
//! ## Features
//!
//! - **Usage tracking** per day, per API type, per user and per custom metric
//! - **Tiered sliding-window rate limiting** (user, address, global) with an explicit block list
//! - **Crash-recoverable snapshots**: atomic JSON writes, partial-default loading
//! - **Live policy updates** without restarting (`arc-swap`, or `RwLock` via `adaptive-rwlock`)
//! - **Tower middleware** that admits, times and records each call, plus a metric layer for custom timings and counts
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apiwatch::{Monitor, MonitorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let monitor = Monitor::open(MonitorConfig::new("uploader", "monitoring_data"))?;
//!     monitor.start_maintenance();
//!
//!     match monitor.check("auth_operation", Some("user@example.com"), None) {
//!         Ok(()) => {
//!             // Your API call here
//!             monitor.tracker().record("auth_operation", Some("user@example.com"), true, Some(212.0), None);
//!         }
//!         Err(limited) => eprintln!("{limited}"),
//!     }
//!
//!     println!("{:?}", monitor.tracker().system_health().status);
//!     monitor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod limiter;
pub mod maintenance;
pub mod monitor;
pub mod store;
pub mod tracker;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AbusePolicy, MonitorConfig, PolicyTable, RateLimitPolicy, RetentionPolicy, SharedPolicy,
};
pub use error::{ConfigError, GuardError, RateLimitExceeded, StoreError};
pub use guard::{CallContext, GuardLayer, GuardService, MetricLayer, MetricService};
pub use limiter::{
    BlockEntry, CleanupReport, Decision, RateLimitStats, RateLimiter, Tier, UserRateInfo,
};
pub use maintenance::MaintenanceHandle;
pub use monitor::Monitor;
pub use store::SnapshotStore;
pub use tracker::summary::{HealthStatus, StatsSummary, StorageInfo, SystemHealth};
pub use tracker::{CallOutcome, ExportFormat, UsageTracker};
