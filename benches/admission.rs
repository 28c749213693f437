use apiwatch::{GuardLayer, ManualClock, Monitor, MonitorConfig, PolicyTable, RateLimitPolicy};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, Service};

fn bench_monitor(dir: &std::path::Path, clock: &ManualClock) -> Monitor {
    // large budget so the hot path stays on the allow branch
    let table = PolicyTable::default().with_limit("upload", RateLimitPolicy { max_calls: 1_000, window_minutes: 1 });
    let config = MonitorConfig::new("bench", dir).with_rate_limits(table);
    Monitor::open_with_clock(config, Arc::new(clock.clone())).unwrap()
}

fn admission_allowed(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let monitor = bench_monitor(dir.path(), &clock);
    let users: Vec<String> = (0..64).map(|i| format!("user{i}@example.com")).collect();
    let mut i = 0usize;

    c.bench_function("admission_allowed_64_users", |b| {
        b.iter(|| {
            i = i.wrapping_add(1);
            // keep every window log below its budget
            clock.advance(Duration::from_millis(100));
            let user = &users[i % users.len()];
            black_box(monitor.limiter().is_rate_limited(black_box("upload"), Some(user), Some("10.0.0.1"), None, None))
        });
    });
}

fn admission_denied(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let monitor = bench_monitor(dir.path(), &clock);
    monitor.limiter().block_user("blocked@example.com", "bench", 60);

    c.bench_function("admission_denied_blocked_user", |b| {
        b.iter(|| black_box(monitor.check(black_box("upload"), Some("blocked@example.com"), None)));
    });
}

fn record_call(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let monitor = bench_monitor(dir.path(), &clock);

    c.bench_function("tracker_record_with_latency", |b| {
        b.iter(|| monitor.tracker().record(black_box("upload"), Some("user@example.com"), true, Some(123.0), None));
    });
}

fn guarded_call(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let monitor = bench_monitor(dir.path(), &clock);
    let svc = GuardLayer::new(&monitor, "upload")
        .auto_block(false)
        .layer(service_fn(|req: &'static str| async move { Ok::<_, std::io::Error>(req) }));

    c.bench_function("guarded_echo", |b| {
        b.to_async(&rt).iter(|| async {
            clock.advance(Duration::from_millis(100));
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, admission_allowed, admission_denied, record_call, guarded_call);
criterion_main!(benches);
