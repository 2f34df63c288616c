//! Listener contract
//!
//! Anything that wants to hear about a variable implements
//! [`NotificationReceiver`]. Objects that only hold a receiver (a widget
//! wrapping an inner event handler, for instance) implement
//! [`HasNotificationDelegate`] instead and are asked for their delegate on
//! every delivery.
//!
//! A third kind of listener is a plain queue: [`Listener::Channel`] posts
//! every notification into a crossbeam channel so a UI thread can drain
//! them at its own pace.
//!
//! Variables never own their listeners. Receivers are held through `Weak`
//! references and a channel is only a sender, so a listener whose owner has
//! gone away simply stops accepting deliveries and is dropped by the
//! fan-out.

use crate::types::Notification;
use crossbeam_channel::Sender;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Why a listener refused a notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The listener cannot take notifications any more (stale widget,
    /// closed view, ...). The fan-out unregisters it.
    #[error("listener rejected notification: {0}")]
    Rejected(String),

    /// The listener wants the whole fan-out to stop. Propagated to the
    /// caller instead of unregistering the listener.
    #[error("listener requested shutdown")]
    Shutdown,
}

/// Capability to receive notifications
#[cfg_attr(test, mockall::automock)]
pub trait NotificationReceiver: Send + Sync {
    /// Handle one notification
    fn on_notification(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Capability to name an inner receiver that handles notifications
pub trait HasNotificationDelegate: Send + Sync {
    /// The receiver notifications should be forwarded to, if any
    fn notification_delegate(&self) -> Option<Arc<dyn NotificationReceiver>>;
}

/// Type-erased handler registered together with its owner
pub type HandlerFn = Arc<
    dyn Fn(&(dyn Any + Send + Sync), &Notification) -> Result<(), DeliveryError> + Send + Sync,
>;

/// A listener handle as passed to `add_listener` / `remove_listener`
///
/// Cloning is cheap. Two handles refer to the same listener when they wrap
/// the same allocation (or the same channel). Handler listeners also compare
/// the handler, so one owner can register several handlers.
#[derive(Clone)]
pub enum Listener {
    /// Receives notifications itself
    Receiver(Arc<dyn NotificationReceiver>),
    /// Forwards to the receiver it designates
    Delegating(Arc<dyn HasNotificationDelegate>),
    /// Raw delivery into a queue
    Channel(Sender<Notification>),
    /// An owner plus an explicit handler invoked with it
    Handler {
        owner: Arc<dyn Any + Send + Sync>,
        handler: HandlerFn,
    },
}

impl Listener {
    /// Wrap a receiver
    pub fn receiver<R: NotificationReceiver + 'static>(receiver: &Arc<R>) -> Self {
        Listener::Receiver(receiver.clone())
    }

    /// Wrap an object that forwards to a delegate
    pub fn delegating<D: HasNotificationDelegate + 'static>(owner: &Arc<D>) -> Self {
        Listener::Delegating(owner.clone())
    }

    /// Wrap a channel sender
    pub fn channel(sender: Sender<Notification>) -> Self {
        Listener::Channel(sender)
    }

    /// Register `owner` with an explicit handler
    ///
    /// The handler gets the owner back on every delivery, which lets types
    /// that do not implement [`NotificationReceiver`] listen anyway.
    pub fn with_handler<L, F>(owner: &Arc<L>, handler: F) -> Self
    where
        L: Send + Sync + 'static,
        F: Fn(&L, &Notification) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let handler: HandlerFn = Arc::new(
            move |any: &(dyn Any + Send + Sync), notification: &Notification| {
                match any.downcast_ref::<L>() {
                    Some(owner) => handler(owner, notification),
                    None => Err(DeliveryError::Rejected(
                        "handler owner has an unexpected type".to_string(),
                    )),
                }
            },
        );
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        Listener::Handler { owner, handler }
    }

    /// True if both handles refer to the same listener
    pub fn is_same(&self, other: &Listener) -> bool {
        match (self, other) {
            (Listener::Receiver(a), Listener::Receiver(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Listener::Delegating(a), Listener::Delegating(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Listener::Channel(a), Listener::Channel(b)) => a.same_channel(b),
            (
                Listener::Handler { owner: a, handler: f },
                Listener::Handler { owner: b, handler: g },
            ) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)) && Arc::ptr_eq(f, g),
            _ => false,
        }
    }

    /// Short label for log messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Listener::Receiver(_) => "receiver",
            Listener::Delegating(_) => "delegating",
            Listener::Channel(_) => "channel",
            Listener::Handler { .. } => "handler",
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener::{}", self.kind_name())
    }
}

impl<R: NotificationReceiver + 'static> From<Arc<R>> for Listener {
    fn from(receiver: Arc<R>) -> Self {
        Listener::Receiver(receiver)
    }
}

impl From<Sender<Notification>> for Listener {
    fn from(sender: Sender<Notification>) -> Self {
        Listener::Channel(sender)
    }
}

/// Adapter that turns a closure into a receiver
///
/// Handy for tests and for wiring a variable straight into a callback.
pub struct FnReceiver<F>(F);

impl<F> FnReceiver<F>
where
    F: Fn(&Notification) -> Result<(), DeliveryError> + Send + Sync,
{
    /// Wrap `f` in an `Arc` ready to be registered
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self(f))
    }
}

impl<F> NotificationReceiver for FnReceiver<F>
where
    F: Fn(&Notification) -> Result<(), DeliveryError> + Send + Sync,
{
    fn on_notification(&self, notification: &Notification) -> Result<(), DeliveryError> {
        (self.0)(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, VariableId};
    use crossbeam_channel::bounded;

    #[test]
    fn test_same_receiver_identity() {
        let a = FnReceiver::new(|_| Ok(()));
        let b = FnReceiver::new(|_| Ok(()));

        let la = Listener::receiver(&a);
        assert!(la.is_same(&Listener::receiver(&a)));
        assert!(!la.is_same(&Listener::receiver(&b)));
    }

    #[test]
    fn test_same_channel_identity() {
        let (tx1, _rx1) = bounded::<Notification>(1);
        let (tx2, _rx2) = bounded::<Notification>(1);

        let l1 = Listener::channel(tx1.clone());
        assert!(l1.is_same(&Listener::channel(tx1)));
        assert!(!l1.is_same(&Listener::channel(tx2)));
    }

    #[test]
    fn test_mixed_kinds_never_match() {
        let a = FnReceiver::new(|_| Ok(()));
        let (tx, _rx) = bounded::<Notification>(1);
        assert!(!Listener::receiver(&a).is_same(&Listener::channel(tx)));
    }

    #[test]
    fn test_handler_identity_follows_owner_and_handler() {
        struct Owner;
        let owner = Arc::new(Owner);

        let a = Listener::with_handler(&owner, |_o: &Owner, _n| Ok(()));
        let b = Listener::with_handler(&owner, |_o: &Owner, _n| Ok(()));
        assert!(a.is_same(&a.clone()));
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_mock_receiver_called() {
        let mut mock = MockNotificationReceiver::new();
        mock.expect_on_notification()
            .withf(|n| n.value == Value::Float(2.0))
            .times(1)
            .returning(|_| Ok(()));

        let n = Notification::new(VariableId(7), 0.0, Value::Float(2.0));
        assert!(mock.on_notification(&n).is_ok());
    }
}
