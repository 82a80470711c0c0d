//! # Liveness and Criticality Monitor
//!
//! Process-scoped watchdog handed to every long-running task. The main event
//! loops call [`ActivityMonitor::update_activity`] on each iteration; a
//! ticker checks twice per deadlock window that the timestamp keeps moving.
//! When it stops — deadlock, livelock, a wedged event loop — the monitor
//! dumps a backtrace and exits with code 1 after a short grace period so the
//! supervising process manager restarts the service. Panics in protected
//! tasks and explicit fatals take the same path.
//!
//! The monitor is an explicit value threaded from process start, not ambient
//! state; tests can construct one with a long timeout and never trip it.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

/// Seconds between the fatal log line and the actual exit, giving log
/// shippers a chance to flush.
pub const EXIT_GRACE: Duration = Duration::from_secs(3);

/// Deadlock watchdog plus fatal/panic funnel.
pub struct ActivityMonitor {
    last_activity: Mutex<Instant>,
    deadlock_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ActivityMonitor {
    /// Start the watchdog with the given deadlock window.
    pub fn start(deadlock_timeout: Duration) -> Arc<Self> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::new(Self {
            last_activity: Mutex::new(Instant::now()),
            deadlock_timeout,
            stop_tx,
            ticker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let ticker_monitor = monitor.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(deadlock_timeout / 2);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = interval.tick() => {
                        let idle = ticker_monitor.idle_for();
                        if idle > ticker_monitor.deadlock_timeout {
                            fatal_exit(&format!(
                                "deadlock detected: no activity for {:.1}s",
                                idle.as_secs_f64()
                            ))
                            .await;
                        }
                    }
                }
            }
        });
        *monitor.ticker.lock().expect("ticker lock") = Some(handle);

        monitor
    }

    /// Record that an event loop made progress.
    pub fn update_activity(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    /// Log a critical error with a captured backtrace. Does not exit.
    pub fn log_critical(&self, msg: &str) {
        error!(backtrace = %Backtrace::force_capture(), "CRITICAL: {msg}");
    }

    /// Log a critical error, wait the grace period, exit with code 1.
    pub async fn log_fatal(&self, msg: &str) {
        self.log_critical(msg);
        fatal_exit(msg).await;
    }

    /// Run a long-lived task under panic protection: a panicking task is
    /// logged with its backtrace and takes the whole process down the fatal
    /// path, letting the supervisor restart from a clean slate.
    pub fn spawn_protected<F>(self: &Arc<Self>, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let monitor = self.clone();
        tokio::spawn(async move {
            let inner = tokio::spawn(future);
            match inner.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    monitor.log_critical(&format!("panic in task {name:?}"));
                    fatal_exit(&format!("panic in task {name:?}")).await;
                }
                Err(_cancelled) => {}
            }
        })
    }

    /// Stop the watchdog ticker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);
    }
}

async fn fatal_exit(msg: &str) {
    error!(
        backtrace = %Backtrace::force_capture(),
        "{msg}; exiting in {}s for supervisor restart",
        EXIT_GRACE.as_secs()
    );
    tokio::time::sleep(EXIT_GRACE).await;
    std::process::exit(1);
}
