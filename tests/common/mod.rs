//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use livevar::{DeliveryError, Notification, NotificationReceiver, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(500)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Poll `condition` until it holds or the test timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Listener that keeps every notification it receives
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every notification from now on
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn values(&self) -> Vec<Value> {
        self.notifications().into_iter().map(|n| n.value).collect()
    }

    pub fn last(&self) -> Option<Notification> {
        self.seen.lock().unwrap().last().cloned()
    }
}

impl NotificationReceiver for Recorder {
    fn on_notification(&self, notification: &Notification) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected("recorder closed".to_string()));
        }
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Getter source returning 0, 1, 2, ... and remembering the last value
#[derive(Default)]
pub struct Counter {
    next: AtomicI64,
}

impl Counter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tick(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Last value handed out, `None` before the first call
    pub fn last(&self) -> Option<i64> {
        let next = self.next.load(Ordering::SeqCst);
        (next > 0).then(|| next - 1)
    }

    pub fn calls(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}
