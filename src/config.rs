//! Configuration for livevar
//!
//! The `livevar` binary reads a TOML file describing polling defaults,
//! logging and the sources to run:
//!
//! ```toml
//! [polling]
//! default_interval = 0.5
//! history_capacity = 10000
//! channel_capacity = 1024
//!
//! [logging]
//! filter = "info,livevar=debug"
//! directory = "/tmp/livevar-logs"
//!
//! [[sources]]
//! name = "sin"
//! interval = 0.5
//! format = "sin(t/10) = {:.3}"
//! pattern = { type = "sine", frequency = 0.016, amplitude = 1.0 }
//! ```
//!
//! # Default location
//!
//! - **Linux**: `~/.local/share/dev.hxyulin.livevar/livevar.toml`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.livevar/livevar.toml`
//! - **Windows**: `%APPDATA%\dev.hxyulin.livevar\livevar.toml`

use crate::converter::Converter;
use crate::error::{LiveError, Result, ResultExt};
use crate::getter::HistoryGetter;
use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::scheduler::validate_interval;
use crate::signal::{Signal, SignalPattern};
use crate::types::{Value, ValueKind};
use crate::variable::Variable;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.hxyulin.livevar";

/// Config filename inside the app data directory
pub const CONFIG_FILE: &str = "livevar.toml";

/// Default polling interval in seconds
pub const DEFAULT_INTERVAL_SECS: f64 = 0.5;

/// Default capacity of channel listeners
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default tracing filter
pub const DEFAULT_LOG_FILTER: &str = "info,livevar=debug";

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Path of the config file in the app data directory
pub fn default_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

/// Polling defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Interval (seconds) for sources that do not set their own
    pub default_interval: f64,
    /// Rows kept by history getters
    pub history_capacity: usize,
    /// Queue size of channel listeners
    pub channel_capacity: usize,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_INTERVAL_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Logging setup for the binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Also write daily rolling log files here
    pub directory: Option<PathBuf>,
    /// File name prefix for rolling logs
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: "livevar.log".to_string(),
        }
    }
}

/// One synthetic source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub pattern: SignalPattern,
    #[serde(default)]
    pub kind: ValueKind,
    /// Polling interval in seconds; `None` uses the default
    #[serde(default)]
    pub interval: Option<f64>,
    /// Amplitude of uniform noise added to the pattern
    #[serde(default)]
    pub noise: f64,
    /// Rhai converter script
    #[serde(default)]
    pub converter: Option<String>,
    /// Display template, `{}` or `{:.N}`
    #[serde(default)]
    pub format: Option<String>,
    /// Poll this source (otherwise it is only pulled)
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, pattern: SignalPattern) -> Self {
        Self {
            name: name.into(),
            pattern,
            kind: ValueKind::Float,
            interval: None,
            noise: 0.0,
            converter: None,
            format: None,
            autostart: true,
        }
    }

    /// Effective interval in seconds
    pub fn interval_or(&self, polling: &PollingSettings) -> f64 {
        self.interval.unwrap_or(polling.default_interval)
    }

    /// Build a variable sampling this source
    pub fn build_variable(&self, polling: &PollingSettings) -> Result<Variable> {
        let signal = Signal::new(self.pattern).with_noise(self.noise);
        let mut builder = Variable::builder()
            .name(self.name.clone())
            .kind(self.kind)
            .getter_fn(signal.into_getter())
            .interval(self.interval_or(polling));

        if let Some(script) = &self.converter {
            builder = builder.converter(Converter::compile(self.name.clone(), script.clone())?);
        }

        builder
            .build()
            .with_context(|| format!("Failed to create source '{}'", self.name))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    /// Version for future migration support
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for LiveConfig {
    /// Two slow waves, one polled and one pulled
    fn default() -> Self {
        let mut cos = SourceConfig::new(
            "cos",
            SignalPattern::Sine {
                frequency: 1.0 / (20.0 * std::f64::consts::PI),
                amplitude: 1.0,
                offset: 0.0,
                phase: std::f64::consts::FRAC_PI_2,
            },
        );
        cos.autostart = false;
        cos.format = Some("cos(t/10) = {:.3}".to_string());

        let mut sin = SourceConfig::new(
            "sin",
            SignalPattern::Sine {
                frequency: 1.0 / (20.0 * std::f64::consts::PI),
                amplitude: 1.0,
                offset: 0.0,
                phase: 0.0,
            },
        );
        sin.format = Some("sin(t/10) = {:.3}".to_string());

        Self {
            version: 1,
            polling: PollingSettings::default(),
            logging: LoggingSettings::default(),
            sources: vec![sin, cos],
        }
    }
}

impl LiveConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| LiveError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LiveError::Serialization(format!("Failed to serialize config: {}", e)))
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LiveError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Write the config, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LiveError::Config(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }
        let content = self.to_toml_string()?;
        std::fs::write(path, content)
            .map_err(|e| LiveError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Check intervals, capacities, names and scripts
    pub fn validate(&self) -> Result<()> {
        validate_interval(self.polling.default_interval).context("polling.default_interval")?;
        if self.polling.history_capacity == 0 {
            return Err(LiveError::Config(
                "polling.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.polling.channel_capacity == 0 {
            return Err(LiveError::Config(
                "polling.channel_capacity must be at least 1".to_string(),
            ));
        }

        for (index, source) in self.sources.iter().enumerate() {
            if source.name.trim().is_empty() {
                return Err(LiveError::Config(format!("sources[{}] has no name", index)));
            }
            if self.sources[..index].iter().any(|s| s.name == source.name) {
                return Err(LiveError::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if let Some(interval) = source.interval {
                validate_interval(interval)
                    .with_context(|| format!("sources[{}].interval", index))?;
            }
            if let Some(script) = &source.converter {
                Converter::validate(script)
                    .with_context(|| format!("sources[{}].converter", index))?;
            }
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// History of `variables` with a leading elapsed-time column
    ///
    /// Keeps `polling.history_capacity` rows and polls at
    /// `polling.default_interval` once started. Each column pulls its
    /// variable, so sources that are already polled are not sampled twice.
    pub fn build_history(&self, variables: &[Arc<Variable>]) -> Result<HistoryGetter> {
        let mut builder = HistoryGetter::builder()
            .name("sources")
            .timed(0.0)
            .capacity(self.polling.history_capacity)
            .interval(self.polling.default_interval);
        for variable in variables {
            let source = variable.clone();
            builder = builder.channel(move || {
                Ok(source.get_value(false)?.unwrap_or(Value::Float(f64::NAN)))
            });
        }
        builder.build().context("Failed to create source history")
    }
}
