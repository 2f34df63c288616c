//! Error handling for livevar
//!
//! This module defines the error type shared by variables, history getters,
//! the polling scheduler and the configuration layer, together with a
//! Result alias and a context extension trait.

use crate::types::ValueKind;
use thiserror::Error;

/// Main error type for livevar operations
#[derive(Error, Debug)]
pub enum LiveError {
    /// A value could not be coerced to the variable's declared kind
    #[error("Cannot coerce {found} to {expected}")]
    TypeCoercion { expected: ValueKind, found: String },

    /// Invalid interval, missing source function or other bad setup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A listener failed to accept a notification
    ///
    /// Only produced inside the fan-out, which logs it and drops the
    /// listener. Public operations never return it.
    #[error("Listener delivery error: {0}")]
    ListenerDelivery(String),

    /// The background polling task failed
    #[error("Polling task error: {0}")]
    PollingTask(String),

    /// The listener was never registered with this variable
    #[error("Listener is not registered")]
    NotRegistered,

    /// A user-supplied get or set function failed
    #[error("Source error: {0}")]
    Source(#[from] anyhow::Error),

    /// Errors related to converter scripts
    #[error("Script error: {0}")]
    Script(String),

    /// A listener asked for the fan-out to stop
    #[error("Shutdown requested")]
    Shutdown,

    /// Errors related to configuration files
    #[error("Config error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<LiveError>,
    },
}

impl LiveError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        LiveError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        LiveError::Script(err.to_string())
    }

    /// Shorthand for a coercion failure
    pub fn coercion(expected: ValueKind, found: impl Into<String>) -> Self {
        LiveError::TypeCoercion {
            expected,
            found: found.into(),
        }
    }

    /// True if this error (or the error it wraps) is a shutdown request
    pub fn is_shutdown(&self) -> bool {
        match self {
            LiveError::Shutdown => true,
            LiveError::WithContext { source, .. } => source.is_shutdown(),
            _ => false,
        }
    }
}

/// Result type alias for livevar operations
pub type Result<T> = std::result::Result<T, LiveError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| LiveError::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| LiveError::from_rhai_error(e).with_context(f()))
    }
}
