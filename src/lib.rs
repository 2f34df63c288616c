//! # livevar: observable polled variables
//!
//! A [`Variable`] wraps a value that lives somewhere else (a sensor, a
//! device register, a computation) behind a get function and an optional
//! set function. It can poll the getter on a background thread and pushes
//! every new value to its listeners.
//!
//! ## Architecture
//!
//! - **Variables**: [`Variable`] owns the value, the source functions and
//!   its listener registry
//! - **Scheduler**: [`scheduler::PollingTask`] runs one polling thread per
//!   started variable
//! - **Listeners**: [`Listener`] covers receivers, delegating owners,
//!   crossbeam channels and bound handlers. Listeners that fail are pruned
//!   during fan-out
//! - **History**: [`HistoryGetter`] samples several channels into one row
//!   and keeps a bounded history of rows
//! - **Consumers**: [`widgets`] and [`chart`] are headless text, input and
//!   plot models that follow variables
//! - **Scripting**: Rhai [`Converter`] scripts transform raw samples
//!
//! ## Configuration
//!
//! The `livevar` binary reads a TOML file from the platform data directory
//! under `dev.hxyulin.livevar`, see [`config`].
//!
//! ## Example
//!
//! ```ignore
//! use livevar::{Listener, Variable};
//!
//! let (tx, rx) = crossbeam_channel::bounded(64);
//! let counter = std::sync::atomic::AtomicI64::new(0);
//! let var = Variable::builder()
//!     .name("counter")
//!     .getter(move || Ok(counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst).into()))
//!     .interval(0.01)
//!     .build()?;
//!
//! var.add_listener(&Listener::channel(tx))?;
//! var.start(None)?;
//! std::thread::sleep(std::time::Duration::from_millis(50));
//! var.stop();
//!
//! for notification in rx.try_iter() {
//!     println!("{} = {}", notification.source, notification.value);
//! }
//! ```

pub mod chart;
pub mod config;
pub mod converter;
pub mod error;
pub mod getter;
pub mod history;
pub mod listener;
pub mod registry;
pub mod scheduler;
pub mod signal;
pub mod types;
pub mod variable;
pub mod widgets;

mod util;

// Re-export commonly used types
pub use chart::{HistoryPlot, PlotStyle, StripChart};
pub use config::LiveConfig;
pub use converter::Converter;
pub use error::{LiveError, Result};
pub use getter::HistoryGetter;
pub use history::HistoryBuffer;
pub use listener::{DeliveryError, HasNotificationDelegate, Listener, NotificationReceiver};
pub use registry::{FanoutReport, ListenerRegistry};
pub use signal::{Signal, SignalPattern};
pub use types::{Notification, Value, ValueKind, VariableId};
pub use variable::{Variable, VariableBuilder};
pub use widgets::{LiveChoice, LiveInput, LiveRadio, LiveText, LiveToggle, TextFormat};
