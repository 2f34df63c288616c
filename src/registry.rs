//! Listener registry and notification fan-out
//!
//! The registry keeps listeners in registration order and delivers one
//! [`Notification`] to each of them. Delivery works on a snapshot of the
//! registry, so listeners may be added or removed (even from inside a
//! callback) while a fan-out is running.
//!
//! # Self-healing
//!
//! A listener is unregistered when delivering to it fails:
//!
//! - its receiver returned [`DeliveryError::Rejected`] or panicked
//! - its owner has been dropped (the `Weak` no longer upgrades)
//! - its channel is disconnected
//!
//! The remaining listeners still get the notification. A full channel is
//! not a failure: the notification is dropped for that listener and counted.
//!
//! [`DeliveryError::Shutdown`] is the one error that is not swallowed. It
//! aborts the fan-out and is returned as [`LiveError::Shutdown`].

use crate::error::{LiveError, Result};
use crate::listener::{DeliveryError, HandlerFn, HasNotificationDelegate, Listener, NotificationReceiver};
use crate::types::Notification;
use crate::util::{lock, panic_message};
use crossbeam_channel::{Sender, TrySendError};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

/// Non-owning view of a listener
#[derive(Clone)]
enum Target {
    Receiver(Weak<dyn NotificationReceiver>),
    Delegating(Weak<dyn HasNotificationDelegate>),
    Channel(Sender<Notification>),
    Handler {
        owner: Weak<dyn Any + Send + Sync>,
        handler: HandlerFn,
    },
}

/// Identity used to find a registration again
#[derive(Clone)]
enum Key {
    Addr(usize),
    Channel(Sender<Notification>),
    /// Owner and handler closure; one owner may register several handlers
    Handler(usize, usize),
}

impl Key {
    fn of(listener: &Listener) -> Self {
        match listener {
            Listener::Receiver(r) => Key::Addr(std::sync::Arc::as_ptr(r) as *const () as usize),
            Listener::Delegating(d) => Key::Addr(std::sync::Arc::as_ptr(d) as *const () as usize),
            Listener::Channel(tx) => Key::Channel(tx.clone()),
            Listener::Handler { owner, handler } => Key::Handler(
                std::sync::Arc::as_ptr(owner) as *const () as usize,
                std::sync::Arc::as_ptr(handler) as *const () as usize,
            ),
        }
    }

    fn matches(&self, other: &Key) -> bool {
        match (self, other) {
            (Key::Addr(a), Key::Addr(b)) => a == b,
            (Key::Channel(a), Key::Channel(b)) => a.same_channel(b),
            (Key::Handler(a, f), Key::Handler(b, g)) => a == b && f == g,
            _ => false,
        }
    }
}

#[derive(Clone)]
struct Entry {
    id: u64,
    key: Key,
    kind: &'static str,
    target: Target,
}

/// What happened when delivering to one listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The listener took the notification
    Delivered,
    /// The listener is fine but had nothing to deliver to (no delegate)
    Skipped,
    /// The listener's queue was full, the notification was dropped
    Dropped,
    /// The listener is broken and must be unregistered
    Failed(String),
    /// The listener asked for the fan-out to stop
    Shutdown,
}

/// Summary of one fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Listeners that received the notification
    pub delivered: usize,
    /// Listeners that were skipped (initiator, missing delegate)
    pub skipped: usize,
    /// Notifications dropped on full channels
    pub dropped: usize,
    /// Listeners removed because delivery failed
    pub removed: usize,
}

/// Ordered collection of listeners for one variable
pub struct ListenerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a listener
    ///
    /// Returns `false` if the listener was already registered, in which case
    /// nothing changes.
    pub fn add(&self, listener: &Listener) -> bool {
        let key = Key::of(listener);
        let mut entries = lock(&self.entries);
        if entries.iter().any(|e| e.key.matches(&key)) {
            return false;
        }

        let target = match listener {
            Listener::Receiver(r) => Target::Receiver(std::sync::Arc::downgrade(r)),
            Listener::Delegating(d) => Target::Delegating(std::sync::Arc::downgrade(d)),
            Listener::Channel(tx) => Target::Channel(tx.clone()),
            Listener::Handler { owner, handler } => Target::Handler {
                owner: std::sync::Arc::downgrade(owner),
                handler: handler.clone(),
            },
        };

        entries.push(Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            kind: listener.kind_name(),
            target,
        });
        true
    }

    /// Unregister a listener
    ///
    /// Fails with [`LiveError::NotRegistered`] if it was never registered
    /// (or has already been removed by the fan-out).
    pub fn remove(&self, listener: &Listener) -> Result<()> {
        let key = Key::of(listener);
        let mut entries = lock(&self.entries);
        match entries.iter().position(|e| e.key.matches(&key)) {
            Some(index) => {
                entries.remove(index);
                Ok(())
            }
            None => Err(LiveError::NotRegistered),
        }
    }

    /// True if the listener is currently registered
    pub fn contains(&self, listener: &Listener) -> bool {
        let key = Key::of(listener);
        lock(&self.entries).iter().any(|e| e.key.matches(&key))
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// True if no listener is registered
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Unregister everything
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    /// Total notifications dropped on full channels since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Deliver `notification` to every listener except `exclude`
    pub fn notify(
        &self,
        notification: &Notification,
        exclude: Option<&Listener>,
    ) -> Result<FanoutReport> {
        let snapshot: Vec<Entry> = lock(&self.entries).clone();
        let exclude = exclude.map(Key::of);

        let mut report = FanoutReport::default();
        let mut failed: Vec<(u64, &'static str, String)> = Vec::new();
        let mut shutdown = false;

        for entry in &snapshot {
            if exclude.as_ref().is_some_and(|k| k.matches(&entry.key)) {
                report.skipped += 1;
                continue;
            }

            match deliver(&entry.target, notification) {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Skipped => report.skipped += 1,
                DeliveryOutcome::Dropped => {
                    report.dropped += 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                DeliveryOutcome::Failed(reason) => failed.push((entry.id, entry.kind, reason)),
                DeliveryOutcome::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
        }

        report.removed = self.prune(notification, failed);

        if shutdown {
            return Err(LiveError::Shutdown);
        }
        Ok(report)
    }

    /// Deliver `notification` to a single registered listener
    ///
    /// Used to bring a freshly attached listener up to date. A failing
    /// listener is removed again.
    pub fn notify_one(&self, listener: &Listener, notification: &Notification) -> Result<DeliveryOutcome> {
        let key = Key::of(listener);
        let entry = lock(&self.entries)
            .iter()
            .find(|e| e.key.matches(&key))
            .cloned()
            .ok_or(LiveError::NotRegistered)?;

        let outcome = deliver(&entry.target, notification);
        match &outcome {
            DeliveryOutcome::Failed(reason) => {
                self.prune(notification, vec![(entry.id, entry.kind, reason.clone())]);
            }
            DeliveryOutcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Shutdown => return Err(LiveError::Shutdown),
            _ => {}
        }
        Ok(outcome)
    }

    fn prune(&self, notification: &Notification, failed: Vec<(u64, &'static str, String)>) -> usize {
        if failed.is_empty() {
            return 0;
        }

        let mut entries = lock(&self.entries);
        let before = entries.len();
        for (id, kind, reason) in &failed {
            let err = LiveError::ListenerDelivery(reason.clone());
            tracing::warn!(
                "Removing {} listener #{} from {}: {}",
                kind,
                id,
                notification.source,
                err
            );
        }
        entries.retain(|e| !failed.iter().any(|(id, _, _)| *id == e.id));
        before - entries.len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

fn deliver(target: &Target, notification: &Notification) -> DeliveryOutcome {
    match target {
        Target::Receiver(weak) => match weak.upgrade() {
            Some(receiver) => call_receiver(receiver.as_ref(), notification),
            None => DeliveryOutcome::Failed("receiver was dropped".to_string()),
        },
        Target::Delegating(weak) => match weak.upgrade() {
            Some(owner) => match owner.notification_delegate() {
                Some(delegate) => call_receiver(delegate.as_ref(), notification),
                None => DeliveryOutcome::Skipped,
            },
            None => DeliveryOutcome::Failed("delegating listener was dropped".to_string()),
        },
        Target::Channel(tx) => match tx.try_send(notification.clone()) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => {
                DeliveryOutcome::Failed("channel disconnected".to_string())
            }
        },
        Target::Handler { owner, handler } => match owner.upgrade() {
            Some(owner) => outcome_of(catch_unwind(AssertUnwindSafe(|| {
                handler(owner.as_ref(), notification)
            }))),
            None => DeliveryOutcome::Failed("handler owner was dropped".to_string()),
        },
    }
}

fn call_receiver(receiver: &dyn NotificationReceiver, notification: &Notification) -> DeliveryOutcome {
    outcome_of(catch_unwind(AssertUnwindSafe(|| {
        receiver.on_notification(notification)
    })))
}

fn outcome_of(
    result: std::thread::Result<std::result::Result<(), DeliveryError>>,
) -> DeliveryOutcome {
    match result {
        Ok(Ok(())) => DeliveryOutcome::Delivered,
        Ok(Err(DeliveryError::Shutdown)) => DeliveryOutcome::Shutdown,
        Ok(Err(DeliveryError::Rejected(reason))) => DeliveryOutcome::Failed(reason),
        Err(payload) => DeliveryOutcome::Failed(format!(
            "listener panicked: {}",
            panic_message(payload.as_ref())
        )),
    }
}
