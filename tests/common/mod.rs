#![allow(dead_code)]

use apiwatch::{ManualClock, Monitor, MonitorConfig, PolicyTable, RateLimitPolicy};
use std::path::Path;
use std::sync::Arc;

/// 2023-11-14T22:13:20Z
pub const EPOCH_MS: u64 = 1_700_000_000_000;

pub fn manual_clock() -> ManualClock {
    ManualClock::starting_at(EPOCH_MS)
}

/// Config whose `upload` budget is 3 calls per minute.
pub fn test_config(dir: &Path) -> MonitorConfig {
    let table = PolicyTable::default().with_limit("upload", RateLimitPolicy { max_calls: 3, window_minutes: 1 });
    MonitorConfig::new("apiwatch-tests", dir).with_rate_limits(table)
}

pub fn open_monitor(dir: &Path, clock: &ManualClock) -> Monitor {
    Monitor::open_with_clock(test_config(dir), Arc::new(clock.clone())).expect("valid test config")
}
