//! Observable live variable
//!
//! A [`Variable`] wraps an external data source: a get function that samples
//! it and optionally a set function that writes to it. Every sample or write
//! is coerced to the variable's [`ValueKind`], timestamped, stored and then
//! pushed to all registered listeners.
//!
//! # Push and pull
//!
//! - **Push**: [`Variable::start`] spawns a [`PollingTask`] that calls
//!   [`Variable::update`] every interval. Listeners hear about every tick.
//! - **Pull**: [`Variable::get_value`] returns the cached value while polling
//!   is active, otherwise it samples synchronously on the caller's thread.
//!
//! # Lifecycle
//!
//! ```text
//!        start()                stop() / drop
//! Idle ───────────▶ Polling ───────────────────▶ Idle
//!                   │     ▲
//!                   └─────┘ start(): only updates the interval
//! ```
//!
//! Dropping a variable stops and joins its polling task.
//!
//! # Example
//!
//! ```ignore
//! use livevar::{Variable, ValueKind, Value};
//!
//! let var = Variable::builder()
//!     .name("temperature")
//!     .kind(ValueKind::Float)
//!     .getter(|| Ok(Value::Float(read_sensor())))
//!     .interval(0.5)
//!     .build()?;
//! var.start(None)?;
//! ```

use crate::converter::Converter;
use crate::error::{LiveError, Result};
use crate::listener::{DeliveryError, Listener};
use crate::registry::ListenerRegistry;
use crate::scheduler::{validate_interval, PollingTask};
use crate::types::{Notification, Value, ValueKind, VariableId};
use crate::util::{lock, read, seconds_between, write};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Zero-argument function sampling a data source
pub type GetterFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// One-argument function writing to a data source
///
/// Whatever it returns is recorded as the variable's reply.
pub type SetterFn = Arc<dyn Fn(&Value) -> anyhow::Result<Option<Value>> + Send + Sync>;

/// Value, reply and timestamp, always updated together
#[derive(Debug, Clone, Default)]
struct State {
    value: Option<Value>,
    reply: Option<Value>,
    timestamp: f64,
}

/// Part of a variable shared with its polling thread
struct Shared {
    id: VariableId,
    name: String,
    kind: ValueKind,
    state: RwLock<State>,
    /// Serializes writers so timestamps stay ordered
    writer: Mutex<()>,
    getter: RwLock<Option<GetterFn>>,
    setter: RwLock<Option<SetterFn>>,
    converter: RwLock<Option<Arc<Converter>>>,
    reply_is_value: AtomicBool,
    time_origin: RwLock<DateTime<Utc>>,
    listeners: ListenerRegistry,
}

impl Shared {
    /// Seconds since the time origin, never earlier than the last timestamp
    fn next_timestamp(&self) -> f64 {
        let origin = *read(&self.time_origin);
        let now = seconds_between(origin, Utc::now());
        now.max(read(&self.state).timestamp)
    }

    fn update(&self) -> Result<Option<Value>> {
        let Some(getter) = read(&self.getter).clone() else {
            return Ok(None);
        };

        let notification = {
            let _writer = lock(&self.writer);
            let raw = getter().map_err(LiveError::Source)?;
            let timestamp = self.next_timestamp();

            let converter = read(&self.converter).clone();
            let raw = match converter {
                Some(converter) => converter.apply(raw, timestamp),
                None => raw,
            };
            let value = self.kind.coerce(raw)?;

            let mut state = write(&self.state);
            state.value = Some(value.clone());
            state.timestamp = timestamp;
            Notification::new(self.id, timestamp, value)
        };

        tracing::trace!("{} = {}", self.name, notification.value);
        self.listeners.notify(&notification, None)?;
        Ok(Some(notification.value))
    }

    fn set_value(&self, value: Value, initiator: Option<&Listener>) -> Result<Value> {
        let value = self.kind.coerce(value)?;
        let setter = read(&self.setter).clone();

        let notification = {
            let _writer = lock(&self.writer);
            let reply = match setter {
                Some(setter) => setter(&value).map_err(LiveError::Source)?,
                None => None,
            };

            let stored = match &reply {
                Some(reply) if self.reply_is_value.load(Ordering::Relaxed) => {
                    self.kind.coerce(reply.clone())?
                }
                _ => value,
            };

            let timestamp = self.next_timestamp();
            let mut state = write(&self.state);
            state.value = Some(stored.clone());
            state.reply = reply.clone();
            state.timestamp = timestamp;
            Notification::new(self.id, timestamp, stored).with_reply(reply)
        };

        tracing::trace!("{} set to {}", self.name, notification.value);
        self.listeners.notify(&notification, initiator)?;
        Ok(notification.value)
    }

    fn current_notification(&self) -> Option<Notification> {
        let state = read(&self.state);
        state.value.as_ref().map(|value| {
            Notification::new(self.id, state.timestamp, value.clone()).with_reply(state.reply.clone())
        })
    }
}

/// Builder for [`Variable`]
#[derive(Default)]
pub struct VariableBuilder {
    name: Option<String>,
    kind: ValueKind,
    initial: Option<Value>,
    getter: Option<GetterFn>,
    setter: Option<SetterFn>,
    interval: Option<f64>,
    listeners: Vec<Listener>,
    reply_is_value: bool,
    converter: Option<Converter>,
    time_origin: Option<DateTime<Utc>>,
}

impl VariableBuilder {
    /// Label used in logs and by widgets
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Coercion rule for stored values (default: float)
    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = kind;
        self
    }

    /// Initial value, written through the setter on build
    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    pub fn getter<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn getter_fn(mut self, getter: GetterFn) -> Self {
        self.getter = Some(getter);
        self
    }

    pub fn setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn setter_fn(mut self, setter: SetterFn) -> Self {
        self.setter = Some(setter);
        self
    }

    /// Polling interval in seconds, used by `start(None)`
    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    /// Listener registered before the first value is produced
    pub fn listener(mut self, listener: &Listener) -> Self {
        self.listeners.push(listener.clone());
        self
    }

    /// Store the setter's reply instead of the written value
    pub fn reply_is_value(mut self, enabled: bool) -> Self {
        self.reply_is_value = enabled;
        self
    }

    pub fn converter(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Wall-clock origin for timestamps (default: build time)
    pub fn time_offset(mut self, origin: DateTime<Utc>) -> Self {
        self.time_origin = Some(origin);
        self
    }

    /// Create the variable
    ///
    /// With an initial value it is set (and listeners notified) right away.
    /// Without one, the getter is called once if there is one.
    pub fn build(self) -> Result<Variable> {
        let interval = self.interval.map(validate_interval).transpose()?;
        let id = VariableId::next();
        let name = self.name.unwrap_or_else(|| id.to_string());

        let shared = Arc::new(Shared {
            id,
            name,
            kind: self.kind,
            state: RwLock::new(State::default()),
            writer: Mutex::new(()),
            getter: RwLock::new(self.getter),
            setter: RwLock::new(self.setter),
            converter: RwLock::new(self.converter.map(Arc::new)),
            reply_is_value: AtomicBool::new(self.reply_is_value),
            time_origin: RwLock::new(self.time_origin.unwrap_or_else(Utc::now)),
            listeners: ListenerRegistry::new(),
        });

        for listener in &self.listeners {
            shared.listeners.add(listener);
        }

        let variable = Variable {
            shared,
            interval: Mutex::new(interval),
            task: Mutex::new(None),
        };

        if let Some(initial) = self.initial {
            variable.set_value(initial)?;
        } else {
            variable.update()?;
        }

        tracing::debug!("Created variable {} ({})", variable.name(), variable.kind());
        Ok(variable)
    }
}

/// Polled, observable value
///
/// Not `Clone`: share it as `Arc<Variable>`. All operations take `&self`.
pub struct Variable {
    shared: Arc<Shared>,
    interval: Mutex<Option<Duration>>,
    task: Mutex<Option<PollingTask>>,
}

impl Variable {
    pub fn builder() -> VariableBuilder {
        VariableBuilder::default()
    }

    pub fn id(&self) -> VariableId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kind(&self) -> ValueKind {
        self.shared.kind
    }

    /// Cached value without sampling
    pub fn value(&self) -> Option<Value> {
        read(&self.shared.state).value.clone()
    }

    /// Reply of the most recent set, if the setter returned one
    pub fn reply(&self) -> Option<Value> {
        read(&self.shared.state).reply.clone()
    }

    /// Seconds since the time origin at the last update
    pub fn timestamp(&self) -> f64 {
        read(&self.shared.state).timestamp
    }

    /// Current value
    ///
    /// While polling is active and `force` is false this is the cached value
    /// and nothing else happens. Otherwise the source is sampled now (and
    /// listeners are notified). Without a getter the cached value is
    /// returned.
    pub fn get_value(&self, force: bool) -> Result<Option<Value>> {
        if self.is_active() && !force {
            return Ok(self.value());
        }
        match self.update()? {
            Some(value) => Ok(Some(value)),
            None => Ok(self.value()),
        }
    }

    /// Write a value and notify every listener
    ///
    /// Returns the value that was stored. A value that cannot be coerced
    /// leaves the variable untouched and notifies nobody.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<Value> {
        self.shared.set_value(value.into(), None)
    }

    /// Write a value on behalf of `initiator`, which is not notified
    pub fn set_value_from(&self, value: impl Into<Value>, initiator: &Listener) -> Result<Value> {
        self.shared.set_value(value.into(), Some(initiator))
    }

    /// Sample the source once and notify every listener
    ///
    /// Returns `None` (and does nothing) without a getter. Every successful
    /// update notifies, even if the value did not change.
    pub fn update(&self) -> Result<Option<Value>> {
        self.shared.update()
    }

    /// Re-send the current state to every listener
    pub fn notify(&self) -> Result<()> {
        match self.shared.current_notification() {
            Some(notification) => self.shared.listeners.notify(&notification, None).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Register a listener and bring it up to date
    ///
    /// If the variable holds a value the listener gets one notification
    /// immediately. Registering the same listener twice does nothing.
    pub fn add_listener(&self, listener: &Listener) -> Result<()> {
        if !self.shared.listeners.add(listener) {
            tracing::debug!("{} listener already registered with {}", listener.kind_name(), self.name());
            return Ok(());
        }
        tracing::debug!("Added {} listener to {}", listener.kind_name(), self.name());

        if let Some(notification) = self.shared.current_notification() {
            self.shared.listeners.notify_one(listener, &notification)?;
        }
        Ok(())
    }

    /// Register `owner` with an explicit handler
    ///
    /// Returns the handle needed to remove it again.
    pub fn add_listener_with<L, F>(&self, owner: &Arc<L>, handler: F) -> Result<Listener>
    where
        L: Send + Sync + 'static,
        F: Fn(&L, &Notification) -> std::result::Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let listener = Listener::with_handler(owner, handler);
        self.add_listener(&listener)?;
        Ok(listener)
    }

    /// Unregister a listener
    pub fn remove_listener(&self, listener: &Listener) -> Result<()> {
        self.shared.listeners.remove(listener)?;
        tracing::debug!("Removed {} listener from {}", listener.kind_name(), self.name());
        Ok(())
    }

    /// Unregister every listener
    pub fn clear_listeners(&self) {
        self.shared.listeners.clear();
        tracing::debug!("Cleared listeners of {}", self.name());
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Notifications dropped on full channel listeners
    pub fn dropped_notifications(&self) -> u64 {
        self.shared.listeners.dropped_count()
    }

    /// Start polling
    ///
    /// `interval` (seconds) replaces the configured interval when given.
    /// Calling `start` while active only changes the interval.
    pub fn start(&self, interval: Option<f64>) -> Result<()> {
        if let Some(seconds) = interval {
            *lock(&self.interval) = Some(validate_interval(seconds)?);
        }
        let interval = lock(&self.interval).ok_or_else(|| {
            LiveError::Configuration(format!("{} has no polling interval", self.name()))
        })?;

        let mut task = lock(&self.task);
        if let Some(running) = task.as_ref().filter(|t| t.is_running()) {
            running.set_interval(interval);
            return Ok(());
        }

        if read(&self.shared.getter).is_none() {
            return Err(LiveError::Configuration(format!(
                "{} has no get function to poll",
                self.name()
            )));
        }

        let shared = self.shared.clone();
        *task = Some(PollingTask::spawn(
            self.name().to_string(),
            interval,
            move || shared.update().map(|_| ()),
        )?);
        Ok(())
    }

    /// Stop polling and wait for the task to exit
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// True while a polling task is alive
    pub fn is_active(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| t.is_running())
    }

    /// Polling interval in seconds
    pub fn interval(&self) -> Option<f64> {
        lock(&self.interval).map(|d| d.as_secs_f64())
    }

    /// Change the polling interval, effective immediately when active
    pub fn set_interval(&self, seconds: f64) -> Result<()> {
        let interval = validate_interval(seconds)?;
        *lock(&self.interval) = Some(interval);
        if let Some(task) = lock(&self.task).as_ref() {
            task.set_interval(interval);
        }
        Ok(())
    }

    pub fn set_getter<F>(&self, getter: F)
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        *write(&self.shared.getter) = Some(Arc::new(getter));
    }

    /// Remove the getter; an active task keeps running but samples nothing
    pub fn clear_getter(&self) {
        *write(&self.shared.getter) = None;
    }

    pub fn set_setter<F>(&self, setter: F)
    where
        F: Fn(&Value) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    {
        *write(&self.shared.setter) = Some(Arc::new(setter));
    }

    pub fn set_reply_is_value(&self, enabled: bool) {
        self.shared.reply_is_value.store(enabled, Ordering::Relaxed);
    }

    /// Replace (or remove) the converter applied to samples
    pub fn set_converter(&self, converter: Option<Converter>) {
        *write(&self.shared.converter) = converter.map(Arc::new);
    }

    /// Wall-clock origin of timestamps
    pub fn time_offset(&self) -> DateTime<Utc> {
        *read(&self.shared.time_origin)
    }

    /// Move the time origin
    ///
    /// The stored timestamp is rebased so it keeps referring to the same
    /// instant.
    pub fn set_time_offset(&self, origin: DateTime<Utc>) {
        let _writer = lock(&self.shared.writer);
        let mut current = write(&self.shared.time_origin);
        let shift = seconds_between(*current, origin);
        *current = origin;
        write(&self.shared.state).timestamp -= shift;
    }

    /// Make "now" the time origin
    pub fn reset_time_offset(&self) {
        self.set_time_offset(Utc::now());
    }
}

impl Drop for Variable {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("value", &self.value())
            .field("active", &self.is_active())
            .finish()
    }
}
