//! Coarse Heartbeat Clock
//!
//! Workers need approximate time for drain deadlines, connect timeouts and
//! reconnect backoff, but reading the system clock on every event is wasted
//! work. Instead a single housekeeping task advances a process-wide tick
//! counter roughly every 100ms and everyone else reads it with one relaxed
//! atomic load.
//!
//! ## Lifecycle
//!
//! ```text
//!   Heartbeat::start()  ──>  tokio task: sleep(TICK); TICKS += 1; ...
//!          │
//!          ▼
//!   drop(heartbeat)     ──>  task stops, counter keeps its last value
//! ```
//!
//! The counter is monotonic and only ever written by the heartbeat task. A
//! second `Heartbeat::start()` while one is running returns a passive handle
//! instead of spawning a second writer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Nominal length of one tick.
pub const TICK: Duration = Duration::from_millis(100);

static TICKS: AtomicU64 = AtomicU64::new(0);
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Current tick count.
#[inline]
pub fn now() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Number of ticks covering `duration`, rounded up.
pub fn ticks_for(duration: Duration) -> u64 {
    let tick = TICK.as_millis();
    let millis = duration.as_millis();
    millis.div_ceil(tick).min(u64::MAX as u128) as u64
}

/// Approximate duration of `ticks` ticks.
pub fn duration_of(ticks: u64) -> Duration {
    TICK.saturating_mul(ticks.min(u32::MAX as u64) as u32)
}

/// True while a heartbeat task owns the counter.
pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// A handle to the running heartbeat.
///
/// When this handle is dropped, the heartbeat task will be stopped.
#[derive(Debug)]
pub struct Heartbeat {
    /// Sender to signal shutdown; `None` for a passive handle
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl Heartbeat {
    /// Starts the heartbeat as a background task on the current tokio
    /// runtime.
    pub fn start() -> Self {
        if RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Heartbeat already running, returning a passive handle");
            return Self { shutdown_tx: None };
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(heartbeat_loop(shutdown_rx));

        info!(tick_ms = TICK.as_millis() as u64, "Heartbeat started");

        Self {
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// True if this handle owns the ticking task.
    pub fn is_owner(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Stops the heartbeat.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        if let Some(tx) = &self.shutdown_tx {
            if tx.send(true).is_ok() {
                info!(ticks = now(), "Heartbeat stopped");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                TICKS.fetch_add(1, Ordering::Relaxed);
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Heartbeat received shutdown signal");
                    break;
                }
            }
        }
    }

    RUNNING.store(false, Ordering::Release);
}

/// Clock control for tests of code that waits on the heartbeat.
#[cfg(test)]
pub(crate) mod testing {
    use super::{TICK, TICKS};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    static CLOCK: Mutex<()> = Mutex::new(());

    /// Serializes tests that move the clock or need it to stand still.
    pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
        CLOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves the clock forward as the heartbeat would.
    pub(crate) fn advance(ticks: u64) {
        TICKS.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Advances the clock one tick per `period` until dropped.
    pub(crate) struct Ticker {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
        _clock: MutexGuard<'static, ()>,
    }

    impl Ticker {
        pub(crate) fn start(period: Duration) -> Self {
            let clock = exclusive();
            let stop = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&stop);
            let thread = thread::spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(period.min(TICK));
                    advance(1);
                }
            });
            Self {
                stop,
                thread: Some(thread),
                _clock: clock,
            }
        }
    }

    impl Drop for Ticker {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}
