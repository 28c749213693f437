mod common;

use apiwatch::UsageTracker;
use common::{manual_clock, open_monitor, test_config};
use std::fs;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capture<F: FnOnce()>(f: F) -> String {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(SharedWriter(buf.clone())))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .without_time()
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = buf.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn block_and_denial_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let clock = manual_clock();
    let output = capture(|| {
        let monitor = open_monitor(dir.path(), &clock);
        monitor.limiter().block_user("spam@x.io", "scraping", 15);
        let _ = monitor.check("upload", Some("spam@x.io"), None);
    });

    assert!(output.contains("apiwatch::limiter"), "{output}");
    assert!(output.contains("WARN"), "{output}");
    assert!(output.contains("user blocked"), "{output}");
    assert!(output.contains("call denied"), "{output}");
    assert!(output.contains("tier=blocked"), "{output}");
}

#[test]
fn corrupt_snapshot_warns_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    fs::write(config.stats_file(), b"[[[").unwrap();

    let output = capture(|| {
        let tracker = UsageTracker::open_with_clock(&config, Arc::new(manual_clock()));
        tracker.record("upload", Some("u@x.io"), true, None, None);
    });

    assert!(output.contains("snapshot unreadable; using defaults"), "{output}");
    assert!(output.contains("api call recorded"), "{output}");
    assert!(output.contains("api_type=\"upload\""), "{output}");
}
