//! Background polling task
//!
//! A [`PollingTask`] owns one worker thread that calls a tick closure at a
//! fixed rate until it is stopped. It is the shared engine behind
//! `Variable::start` and `HistoryGetter::start`.
//!
//! # Stopping
//!
//! The worker checks a shared `running` flag before every tick and before
//! every wait. The wait itself is a `recv_timeout` on a stop channel, so
//! [`PollingTask::stop`] wakes a sleeping worker immediately and then joins
//! it. A tick that never returns therefore blocks `stop`.
//!
//! # Errors
//!
//! A tick returning an error is logged and polling continues with the next
//! tick. Two things end the worker early: a [`LiveError::Shutdown`] error and
//! a panic inside the tick.

use crate::error::{LiveError, Result};
use crate::util::panic_message;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Check a polling interval given in seconds
///
/// The interval must be finite and non-negative. Zero is allowed and means
/// "poll as fast as possible".
pub fn validate_interval(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() {
        return Err(LiveError::Configuration(format!(
            "interval must be a finite number of seconds, got {}",
            seconds
        )));
    }
    if seconds < 0.0 {
        return Err(LiveError::Configuration(format!(
            "interval must not be negative, got {}",
            seconds
        )));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| LiveError::Configuration(format!("invalid interval {}: {}", seconds, e)))
}

/// Handle to a running polling worker
pub struct PollingTask {
    name: String,
    running: Arc<AtomicBool>,
    interval_nanos: Arc<AtomicU64>,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl PollingTask {
    /// Spawn a worker calling `tick` every `interval`
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, tick: F) -> Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let interval_nanos = Arc::new(AtomicU64::new(duration_to_nanos(interval)));
        let (stop_tx, stop_rx) = bounded(1);

        let worker = Worker {
            name: name.clone(),
            running: running.clone(),
            interval_nanos: interval_nanos.clone(),
            stop_rx,
            tick,
        };

        let handle = std::thread::Builder::new()
            .name(format!("poll-{}", name))
            .spawn(move || worker.run())
            .map_err(|e| LiveError::PollingTask(format!("failed to spawn {}: {}", name, e)))?;

        tracing::info!("Polling task {} started ({:?})", name, interval);

        Ok(Self {
            name,
            running,
            interval_nanos,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// True while the worker thread is alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Current interval between ticks
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Change the interval, effective from the next wait
    pub fn set_interval(&self, interval: Duration) {
        self.interval_nanos
            .store(duration_to_nanos(interval), Ordering::Relaxed);
    }

    /// Task name used in logs and the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the worker to stop and wait for it to exit
    ///
    /// Safe to call more than once. When called from the worker thread
    /// itself (a listener stopping its own variable), the worker is told to
    /// stop but not joined.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.try_send(());

        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == std::thread::current().id() {
            tracing::debug!("Polling task {} stopped from its own thread", self.name);
            return;
        }

        if handle.join().is_err() {
            tracing::error!("Polling task {} worker panicked while stopping", self.name);
        }
        tracing::info!("Polling task {} stopped", self.name);
    }
}

impl Drop for PollingTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingTask")
            .field("name", &self.name)
            .field("interval", &self.interval())
            .field("running", &self.is_running())
            .finish()
    }
}

struct Worker<F> {
    name: String,
    running: Arc<AtomicBool>,
    interval_nanos: Arc<AtomicU64>,
    stop_rx: Receiver<()>,
    tick: F,
}

impl<F> Worker<F>
where
    F: FnMut() -> Result<()>,
{
    fn run(mut self) {
        let mut ticks: u64 = 0;

        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();

            match catch_unwind(AssertUnwindSafe(|| (self.tick)())) {
                Ok(Ok(())) => {
                    ticks += 1;
                    tracing::trace!("{} tick {}", self.name, ticks);
                }
                Ok(Err(e)) if e.is_shutdown() => {
                    tracing::info!("{} stopping on shutdown request", self.name);
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!("{} tick failed: {}", self.name, e);
                }
                Err(payload) => {
                    let err = LiveError::PollingTask(format!(
                        "tick panicked: {}",
                        panic_message(payload.as_ref())
                    ));
                    tracing::error!("{} terminated: {}", self.name, err);
                    break;
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if !self.rate_limit(started) {
                break;
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("{} worker exited after {} ticks", self.name, ticks);
    }

    /// Wait out the rest of the interval. Returns false when told to stop.
    fn rate_limit(&self, started: Instant) -> bool {
        let interval = Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed));

        if interval.is_zero() {
            // No rate limiting, just yield
            std::thread::yield_now();
            return !matches!(
                self.stop_rx.try_recv(),
                Ok(()) | Err(TryRecvError::Disconnected)
            );
        }

        let wait = interval.saturating_sub(started.elapsed());
        match self.stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

fn duration_to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_validate_interval() {
        assert_eq!(validate_interval(0.5).unwrap(), Duration::from_millis(500));
        assert_eq!(validate_interval(0.0).unwrap(), Duration::ZERO);
        assert!(validate_interval(-1.0).is_err());
        assert!(validate_interval(f64::NAN).is_err());
        assert!(validate_interval(f64::INFINITY).is_err());
    }

    #[test]
    fn test_task_ticks_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut task = PollingTask::spawn("ticks", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(40));
        assert!(task.is_running());
        task.stop();
        assert!(!task.is_running());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_stop_wakes_long_wait() {
        let mut task = PollingTask::spawn("sleepy", Duration::from_secs(60), || Ok(())).unwrap();
        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_errors_do_not_stop_polling() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut task = PollingTask::spawn("flaky", Duration::from_millis(2), move || {
            c.fetch_add(1, Ordering::SeqCst);
            Err(LiveError::Source(anyhow::anyhow!("device offline")))
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert!(task.is_running());
        task.stop();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_shutdown_ends_task() {
        let task = PollingTask::spawn("quitter", Duration::from_millis(1), || {
            Err(LiveError::Shutdown)
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(!task.is_running());
    }

    #[test]
    fn test_panic_ends_task() {
        let task = PollingTask::spawn("panicky", Duration::from_millis(1), || {
            panic!("sensor exploded")
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(!task.is_running());
    }

    #[test]
    fn test_zero_interval_tight_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut task = PollingTask::spawn("tight", Duration::ZERO, move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        task.stop();
        assert!(count.load(Ordering::SeqCst) > 10);
    }

    #[test]
    fn test_interval_can_change_while_running() {
        let mut task = PollingTask::spawn("retune", Duration::from_millis(5), || Ok(())).unwrap();
        task.set_interval(Duration::from_millis(20));
        assert_eq!(task.interval(), Duration::from_millis(20));
        task.stop();
    }
}
