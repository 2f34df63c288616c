//! Batched history getter
//!
//! A [`HistoryGetter`] samples several channels per tick, concatenates their
//! results into one row and appends it to a [`HistoryBuffer`]. Channels
//! return a number or a row; rows are flattened and must match the width the
//! channel was declared with.
//!
//! The timed variant reserves column 0 for the seconds elapsed since the
//! first sample (or `start`, whichever comes first), plus a fixed offset.
//! `reset` clears that origin, so a restarted session begins near zero again.
//!
//! Listeners receive one [`Notification`] per tick carrying the new row as a
//! [`Value::Row`].

use crate::error::{LiveError, Result};
use crate::history::{HistoryBuffer, DEFAULT_HISTORY_CAPACITY};
use crate::listener::{DeliveryError, Listener};
use crate::registry::ListenerRegistry;
use crate::scheduler::{validate_interval, PollingTask};
use crate::types::{Notification, Value, VariableId};
use crate::util::{lock, read, write};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Zero-argument function producing one channel's sample
pub type ChannelFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;

/// One column group of the default row
#[derive(Clone)]
pub enum DefaultEntry {
    /// Fixed value
    Literal(Value),
    /// Evaluated every time `default()` is called
    Lazy(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultEntry {
    fn evaluate(&self) -> Value {
        match self {
            DefaultEntry::Literal(value) => value.clone(),
            DefaultEntry::Lazy(f) => f(),
        }
    }
}

impl std::fmt::Debug for DefaultEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultEntry::Literal(value) => write!(f, "Literal({})", value),
            DefaultEntry::Lazy(_) => write!(f, "Lazy"),
        }
    }
}

struct Channel {
    func: ChannelFn,
    width: usize,
}

/// Elapsed-time column state of the timed variant
struct Timing {
    offset: f64,
    origin: Mutex<Option<Instant>>,
}

impl Timing {
    fn elapsed(&self) -> f64 {
        let mut origin = lock(&self.origin);
        let t0 = *origin.get_or_insert_with(Instant::now);
        t0.elapsed().as_secs_f64() + self.offset
    }
}

struct Shared {
    id: VariableId,
    name: String,
    channels: Vec<Channel>,
    defaults: Vec<DefaultEntry>,
    timing: Option<Timing>,
    width: usize,
    history: RwLock<HistoryBuffer>,
    writer: Mutex<()>,
    created: Instant,
    listeners: ListenerRegistry,
}

impl Shared {
    fn sample_row(&self) -> Result<Vec<f64>> {
        let mut row = Vec::with_capacity(self.width);
        if let Some(timing) = &self.timing {
            row.push(timing.elapsed());
        }

        for (index, channel) in self.channels.iter().enumerate() {
            let value = (channel.func)().map_err(LiveError::Source)?;
            let start = row.len();
            value.flatten_into(&mut row)?;
            let produced = row.len() - start;
            if produced != channel.width {
                return Err(LiveError::Configuration(format!(
                    "{} channel {} returned {} columns, expected {}",
                    self.name, index, produced, channel.width
                )));
            }
        }
        Ok(row)
    }

    fn timestamp_of(&self, row: &[f64]) -> f64 {
        match (&self.timing, row.first()) {
            (Some(_), Some(t)) => *t,
            _ => self.created.elapsed().as_secs_f64(),
        }
    }

    fn tick(&self) -> Result<Vec<f64>> {
        let notification = {
            let _writer = lock(&self.writer);
            let row = self.sample_row()?;
            write(&self.history).push(row.clone())?;
            Notification::new(self.id, self.timestamp_of(&row), Value::Row(row))
        };

        self.listeners.notify(&notification, None)?;
        match notification.value {
            Value::Row(row) => Ok(row),
            _ => Ok(Vec::new()),
        }
    }

    fn default_row(&self) -> Result<Vec<f64>> {
        let mut row = Vec::with_capacity(self.width);
        if let Some(timing) = &self.timing {
            row.push(timing.offset);
        }
        if self.defaults.is_empty() {
            row.resize(self.width, f64::NAN);
            return Ok(row);
        }
        for entry in &self.defaults {
            entry.evaluate().flatten_into(&mut row)?;
        }
        if row.len() != self.width {
            return Err(LiveError::Configuration(format!(
                "{} default row has {} columns, expected {}",
                self.name,
                row.len(),
                self.width
            )));
        }
        Ok(row)
    }
}

/// Builder for [`HistoryGetter`]
pub struct HistoryGetterBuilder {
    name: Option<String>,
    channels: Vec<Channel>,
    defaults: Vec<DefaultEntry>,
    capacity: usize,
    interval: Option<f64>,
    timed: Option<f64>,
    listeners: Vec<Listener>,
}

impl Default for HistoryGetterBuilder {
    fn default() -> Self {
        Self {
            name: None,
            channels: Vec::new(),
            defaults: Vec::new(),
            capacity: DEFAULT_HISTORY_CAPACITY,
            interval: None,
            timed: None,
            listeners: Vec::new(),
        }
    }
}

impl HistoryGetterBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a channel producing a single number
    pub fn channel<F>(self, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.channel_columns(f, 1)
    }

    /// Add a channel producing a row of `columns` numbers
    pub fn channel_columns<F>(mut self, f: F, columns: usize) -> Self
    where
        F: Fn() -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.channels.push(Channel {
            func: Arc::new(f),
            width: columns,
        });
        self
    }

    /// Add an already shared channel function
    pub fn channel_fn(mut self, func: ChannelFn, columns: usize) -> Self {
        self.channels.push(Channel {
            func,
            width: columns,
        });
        self
    }

    /// Literal default for the next channel group
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.defaults.push(DefaultEntry::Literal(value.into()));
        self
    }

    /// Lazily evaluated default for the next channel group
    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.defaults.push(DefaultEntry::Lazy(Arc::new(f)));
        self
    }

    /// Number of rows kept (default 10 000)
    pub fn capacity(mut self, rows: usize) -> Self {
        self.capacity = rows;
        self
    }

    /// Polling interval in seconds
    pub fn interval(mut self, seconds: f64) -> Self {
        self.interval = Some(seconds);
        self
    }

    /// Prepend an elapsed-time column starting at `offset` seconds
    pub fn timed(mut self, offset: f64) -> Self {
        self.timed = Some(offset);
        self
    }

    pub fn listener(mut self, listener: &Listener) -> Self {
        self.listeners.push(listener.clone());
        self
    }

    /// Create the getter; nothing is sampled yet
    pub fn build(self) -> Result<HistoryGetter> {
        let interval = self.interval.map(validate_interval).transpose()?;

        if let Some(index) = self.channels.iter().position(|c| c.width == 0) {
            return Err(LiveError::Configuration(format!(
                "channel {} must produce at least one column",
                index
            )));
        }
        let width =
            self.channels.iter().map(|c| c.width).sum::<usize>() + usize::from(self.timed.is_some());
        let history = HistoryBuffer::new(self.capacity, width)?;

        let id = VariableId::next();
        let shared = Arc::new(Shared {
            id,
            name: self.name.unwrap_or_else(|| format!("history{}", id.0)),
            channels: self.channels,
            defaults: self.defaults,
            timing: self.timed.map(|offset| Timing {
                offset,
                origin: Mutex::new(None),
            }),
            width,
            history: RwLock::new(history),
            writer: Mutex::new(()),
            created: Instant::now(),
            listeners: ListenerRegistry::new(),
        });

        for listener in &self.listeners {
            shared.listeners.add(listener);
        }

        tracing::debug!(
            "Created history getter {} ({} columns, {} rows)",
            shared.name,
            width,
            self.capacity
        );

        Ok(HistoryGetter {
            shared,
            interval: Mutex::new(interval),
            task: Mutex::new(None),
        })
    }
}

/// Multi-channel sampler with a bounded history
pub struct HistoryGetter {
    shared: Arc<Shared>,
    interval: Mutex<Option<Duration>>,
    task: Mutex<Option<PollingTask>>,
}

impl HistoryGetter {
    pub fn builder() -> HistoryGetterBuilder {
        HistoryGetterBuilder::default()
    }

    pub fn id(&self) -> VariableId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Columns per row
    pub fn width(&self) -> usize {
        self.shared.width
    }

    /// Maximum number of rows kept
    pub fn capacity(&self) -> usize {
        read(&self.shared.history).capacity()
    }

    /// Rows currently stored
    pub fn len(&self) -> usize {
        read(&self.shared.history).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.shared.history).is_empty()
    }

    /// True for the variant with an elapsed-time column
    pub fn is_timed(&self) -> bool {
        self.shared.timing.is_some()
    }

    /// Offset added to the elapsed-time column
    pub fn offset(&self) -> Option<f64> {
        self.shared.timing.as_ref().map(|t| t.offset)
    }

    /// Stored rows, oldest first; only the last `size` when given
    pub fn get_values(&self, size: Option<usize>) -> Vec<Vec<f64>> {
        read(&self.shared.history).get_values(size)
    }

    /// Run `f` against the history without copying it
    pub fn with_history<R>(&self, f: impl FnOnce(&HistoryBuffer) -> R) -> R {
        f(&*read(&self.shared.history))
    }

    /// Current row
    ///
    /// While active this is the latest stored row. Otherwise the channels
    /// are sampled now; that row is returned but not stored and nobody is
    /// notified.
    pub fn get_value(&self) -> Result<Vec<f64>> {
        if self.is_active() {
            if let Some(row) = read(&self.shared.history).last() {
                return Ok(row.to_vec());
            }
        }
        let _writer = lock(&self.shared.writer);
        self.shared.sample_row()
    }

    /// Default row, without touching the channels
    ///
    /// For the timed variant column 0 is the offset. Without configured
    /// defaults every other column is NaN.
    pub fn default(&self) -> Result<Vec<f64>> {
        self.shared.default_row()
    }

    /// Sample one tick: store the row and notify listeners
    pub fn sample(&self) -> Result<Vec<f64>> {
        self.shared.tick()
    }

    /// Stop polling, clear the history and the elapsed-time origin
    pub fn reset(&self) {
        self.stop();
        let _writer = lock(&self.shared.writer);
        write(&self.shared.history).clear();
        if let Some(timing) = &self.shared.timing {
            *lock(&timing.origin) = None;
        }
        tracing::debug!("Reset history getter {}", self.name());
    }

    /// Start polling; see [`crate::Variable::start`]
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

        if let Some(timing) = &self.shared.timing {
            lock(&timing.origin).get_or_insert_with(Instant::now);
        }

        let shared = self.shared.clone();
        *task = Some(PollingTask::spawn(
            self.name().to_string(),
            interval,
            move || shared.tick().map(|_| ()),
        )?);
        Ok(())
    }

    pub fn stop(&self) {
        let task = lock(&self.task).take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|t| t.is_running())
    }

    pub fn interval(&self) -> Option<f64> {
        lock(&self.interval).map(|d| d.as_secs_f64())
    }

    /// Register a listener and send it the latest row (or the default row)
    pub fn add_listener(&self, listener: &Listener) -> Result<()> {
        if !self.shared.listeners.add(listener) {
            return Ok(());
        }
        tracing::debug!("Added {} listener to {}", listener.kind_name(), self.name());

        let latest = read(&self.shared.history).last().map(<[f64]>::to_vec);
        let row = match latest {
            Some(row) => row,
            None => match self.default() {
                Ok(row) => row,
                Err(e) => {
                    tracing::debug!("No default row for {}: {}", self.name(), e);
                    return Ok(());
                }
            },
        };
        let notification =
            Notification::new(self.id(), self.shared.timestamp_of(&row), Value::Row(row));
        self.shared.listeners.notify_one(listener, &notification)?;
        Ok(())
    }

    /// Register `owner` with an explicit handler
    pub fn add_listener_with<L, F>(&self, owner: &Arc<L>, handler: F) -> Result<Listener>
    where
        L: Send + Sync + 'static,
        F: Fn(&L, &Notification) -> std::result::Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let listener = Listener::with_handler(owner, handler);
        self.add_listener(&listener)?;
        Ok(listener)
    }

    pub fn remove_listener(&self, listener: &Listener) -> Result<()> {
        self.shared.listeners.remove(listener)
    }

    /// Unregister every listener
    pub fn clear_listeners(&self) {
        self.shared.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }
}

impl Drop for HistoryGetter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HistoryGetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryGetter")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("width", &self.shared.width)
            .field("rows", &self.len())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn counting_getter(capacity: usize) -> HistoryGetter {
        let counter = Arc::new(AtomicI64::new(0));
        HistoryGetter::builder()
            .capacity(capacity)
            .channel(move || Ok(Value::Int(counter.fetch_add(1, Ordering::SeqCst))))
            .build()
            .unwrap()
    }

    #[test]
    fn test_ring_semantics() {
        let getter = counting_getter(3);
        for _ in 0..5 {
            getter.sample().unwrap();
        }
        assert_eq!(
            getter.get_values(None),
            vec![vec![2.0], vec![3.0], vec![4.0]]
        );
        assert_eq!(getter.get_values(Some(2)), vec![vec![3.0], vec![4.0]]);
    }

    #[test]
    fn test_rows_are_flattened() {
        let getter = HistoryGetter::builder()
            .channel(|| Ok(Value::Float(1.0)))
            .channel_columns(|| Ok(Value::Row(vec![2.0, 3.0])), 2)
            .build()
            .unwrap();
        assert_eq!(getter.width(), 3);
        assert_eq!(getter.sample().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_width_mismatch_is_error() {
        let getter = HistoryGetter::builder()
            .channel(|| Ok(Value::Row(vec![1.0, 2.0])))
            .build()
            .unwrap();
        assert!(matches!(getter.sample(), Err(LiveError::Configuration(_))));
        assert!(getter.is_empty());
    }

    #[test]
    fn test_get_value_inactive_does_not_store() {
        let getter = counting_getter(10);
        assert_eq!(getter.get_value().unwrap(), vec![0.0]);
        assert_eq!(getter.len(), 0);
    }

    #[test]
    fn test_defaults() {
        let getter = HistoryGetter::builder()
            .channel(|| Err(anyhow::anyhow!("offline")))
            .channel_columns(|| Ok(Value::Row(vec![0.0, 0.0])), 2)
            .default_value(1.0)
            .default_fn(|| Value::Row(vec![2.0, 3.0]))
            .timed(5.0)
            .build()
            .unwrap();
        assert_eq!(getter.default().unwrap(), vec![5.0, 1.0, 2.0, 3.0]);
        assert!(getter.sample().is_err());
    }

    #[test]
    fn test_default_without_entries_is_nan() {
        let getter = counting_getter(3);
        let row = getter.default().unwrap();
        assert_eq!(row.len(), 1);
        assert!(row[0].is_nan());
    }

    #[test]
    fn test_timed_column_and_reset() {
        let getter = HistoryGetter::builder()
            .timed(10.0)
            .channel(|| Ok(Value::Float(0.0)))
            .build()
            .unwrap();

        let first = getter.sample().unwrap();
        assert!(first[0] >= 10.0 && first[0] < 11.0);

        std::thread::sleep(Duration::from_millis(20));
        let second = getter.sample().unwrap();
        assert!(second[0] > first[0]);

        getter.reset();
        assert!(getter.is_empty());
        let after = getter.sample().unwrap();
        assert!(after[0] < second[0]);
    }

    #[test]
    fn test_listener_gets_rows() {
        let getter = counting_getter(10);
        let (tx, rx) = unbounded();
        let listener = Listener::channel(tx);
        getter.add_listener(&listener).unwrap();

        // Default row first, since nothing was sampled yet
        assert!(rx.try_recv().is_ok());

        getter.sample().unwrap();
        assert_eq!(rx.try_recv().unwrap().value, Value::Row(vec![0.0]));

        getter.remove_listener(&listener).unwrap();
        getter.sample().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_stop() {
        let getter = counting_getter(100);
        assert!(getter.start(None).is_err());

        getter.start(Some(0.005)).unwrap();
        assert!(getter.is_active());
        std::thread::sleep(Duration::from_millis(40));
        getter.stop();
        assert!(!getter.is_active());
        assert!(getter.len() >= 2);

        getter.reset();
        assert_eq!(getter.len(), 0);
    }
}
