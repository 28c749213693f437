//! Cancellable periodic background tasks.
//!
//! Both components own one: the tracker's autosave loop and the limiter's
//! cleanup loop. The tick body is a plain closure so tests can call the same
//! logic directly instead of waiting on the timer. It runs on the blocking
//! pool since it serializes state and writes to disk.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use std::sync::Arc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Handle to a running periodic task.
///
/// Dropping the handle leaves the task running until the runtime shuts down,
/// matching the daemon behavior hosts expect; call [`stop`](Self::stop) or
/// [`shutdown`](Self::shutdown) to end it early.
#[derive(Debug)]
pub struct MaintenanceHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// The name the task was spawned under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the task to exit after its current tick.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Signal and wait for the task to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.join.await;
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn `tick` every `period` on the current tokio runtime.
///
/// The first tick fires one full `period` after spawning, and the next one
/// waits for the previous tick to finish. Must be called from within a runtime.
pub fn spawn_periodic<F>(name: &'static str, period: Duration, tick: F) -> MaintenanceHandle
where
    F: Fn() + Send + Sync + 'static,
{
    let tick = Arc::new(tick);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = name, period_secs = period.as_secs(), "maintenance task started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    trace!(task = name, "maintenance tick");
                    let tick = Arc::clone(&tick);
                    if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                        warn!(task = name, error = %e, "maintenance tick failed");
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "maintenance task stopped");
    });
    MaintenanceHandle { name, stop: stop_tx, join }
}
