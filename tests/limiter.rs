mod common;

use apiwatch::{Decision, Monitor, RateLimiter, Tier};
use common::{manual_clock, open_monitor, test_config};
use serde_json::Value;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn three_allowed_fourth_denied_then_window_slides() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let monitor = open_monitor(dir.path(), &clock);
    let limiter = monitor.limiter();

    for _ in 0..3 {
        assert_eq!(limiter.is_rate_limited("upload", Some("u@x.io"), None, Some(3), Some(1)), Decision::Allowed);
    }
    let denied = limiter.is_rate_limited("upload", Some("u@x.io"), None, Some(3), Some(1));
    assert!(denied.is_limited());
    assert!(denied.retry_after() > Duration::ZERO);

    clock.advance(Duration::from_secs(61));
    assert!(limiter.is_rate_limited("upload", Some("u@x.io"), None, Some(3), Some(1)).is_allowed());
}

#[test]
fn check_surfaces_typed_error() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let monitor = open_monitor(dir.path(), &clock);
    for _ in 0..3 {
        monitor.check("upload", Some("u@x.io"), None).unwrap();
    }
    let err = monitor.check("upload", Some("u@x.io"), None).unwrap_err();
    assert_eq!(err.retry_after, Duration::from_secs(60));
    assert_eq!(err.to_string(), "Rate limit exceeded for upload (retry in 60 seconds)");
}

#[test]
fn blocked_user_never_touches_window_logs() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let monitor = open_monitor(dir.path(), &clock);
    let limiter = monitor.limiter();
    limiter.block_user("spam@x.io", "Abuse detected", 60);

    for _ in 0..10 {
        let decision = limiter.is_rate_limited("upload", Some("spam@x.io"), Some("6.6.6.6"), None, None);
        assert_eq!(decision.tier(), Some(Tier::Blocked));
    }
    assert_eq!(limiter.user_rate_info("spam@x.io", "upload").calls_made, 0);
    let stats = limiter.rate_limit_stats();
    assert_eq!(stats.total_users_tracked, 0);
    assert_eq!(stats.total_addresses_tracked, 0);
    assert_eq!(stats.blocked_user_list, vec!["spam@x.io".to_string()]);
}

#[test]
fn expired_block_is_evicted_lazily() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let monitor = open_monitor(dir.path(), &clock);
    let limiter = monitor.limiter();
    limiter.block_user("u@x.io", "cooldown", 5);

    clock.advance(Duration::from_secs(5 * 60 + 1));
    assert!(limiter.is_rate_limited("upload", Some("u@x.io"), None, None, None).is_allowed());
    assert_eq!(limiter.rate_limit_stats().blocked_users, 0);
}

#[test]
fn blocks_persist_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let monitor = open_monitor(dir.path(), &clock);
    monitor.limiter().block_user("u@x.io", "manual", 30);

    let doc: Value = serde_json::from_slice(&fs::read(monitor.config().rate_limits_file()).unwrap()).unwrap();
    assert_eq!(doc["blocked_users"]["u@x.io"]["reason"], "manual");

    assert!(monitor.limiter().unblock_user("u@x.io"));
    let doc: Value = serde_json::from_slice(&fs::read(monitor.config().rate_limits_file()).unwrap()).unwrap();
    assert!(doc["blocked_users"].as_object().unwrap().is_empty());
}

#[test]
fn unknown_snapshot_keys_survive_a_save() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let config = test_config(dir.path());
    fs::write(
        config.rate_limits_file(),
        br#"{"user_limits": {"u@x.io": {"upload": [1]}}, "operator_notes": "keep me"}"#,
    )
    .unwrap();

    let limiter = RateLimiter::open_with_clock(&config, Arc::new(clock));
    assert!(limiter.snapshot_now());
    let doc: Value = serde_json::from_slice(&fs::read(config.rate_limits_file()).unwrap()).unwrap();
    assert_eq!(doc["operator_notes"], "keep me");
    assert_eq!(doc["user_limits"]["u@x.io"]["upload"], serde_json::json!([1]));
    assert!(doc["metadata"]["last_cleanup"].is_string());
}

#[tokio::test(start_paused = true)]
async fn cleanup_loop_evicts_stale_logs() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let mut config = test_config(dir.path());
    config.cleanup_interval_secs = 60;
    let monitor = Monitor::open_with_clock(config, Arc::new(clock.clone())).unwrap();
    monitor.start_maintenance();

    monitor.check("upload", Some("once@x.io"), Some("1.2.3.4")).unwrap();
    assert_eq!(monitor.limiter().rate_limit_stats().total_users_tracked, 1);

    clock.advance(Duration::from_secs(25 * 3_600));
    tokio::time::sleep(Duration::from_secs(61)).await;

    let stats = monitor.limiter().rate_limit_stats();
    assert_eq!(stats.total_users_tracked, 0);
    assert_eq!(stats.total_addresses_tracked, 0);

    monitor.shutdown().await;
}
