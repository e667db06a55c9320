//! Per-resource diagnostic logging.
//!
//! Every watched entry carries its own logging switch and verbosity. The
//! [`ResourceLogger`] applies that gate before forwarding to `tracing`, so a
//! noisy resource can be turned down without touching the global filter.
//! Output destination and formatting stay with the subscriber installed by
//! the binary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::WatchError;

/// Verbosity levels for a watched resource, from quietest to noisiest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Nothing is logged.
    Disable,
    /// Only unrecoverable conditions.
    Fatal,
    /// Errors.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages.
    #[default]
    Info,
    /// Everything, including per-poll samples.
    Debug,
}

impl LogLevel {
    /// Returns the level name as used in configuration files.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" | "off" => Ok(Self::Disable),
            "fatal" => Ok(Self::Fatal),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(WatchError::config(format!("unknown log level '{other}'"))),
        }
    }
}

/// Logging switch and verbosity for one watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Whether diagnostics for this resource are emitted at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Most verbose level emitted.
    #[serde(default)]
    pub level: LogLevel,
}

const fn default_enabled() -> bool {
    true
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
        }
    }
}

impl LoggingSettings {
    /// Returns true if a message at `level` passes this resource's gate.
    #[must_use]
    pub fn allows(&self, level: LogLevel) -> bool {
        self.enabled && level != LogLevel::Disable && level <= self.level
    }
}

/// Gated logger bound to a single resource.
#[derive(Debug, Clone)]
pub struct ResourceLogger {
    resource: String,
    settings: LoggingSettings,
}

impl ResourceLogger {
    /// Creates a logger for the resource with the given display name.
    #[must_use]
    pub fn new(resource: impl Into<String>, settings: LoggingSettings) -> Self {
        Self {
            resource: resource.into(),
            settings,
        }
    }

    /// Returns true if `level` would be emitted.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.settings.allows(level)
    }

    /// Emits `message` at `level` if the resource's settings allow it.
    pub fn log(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        let resource = self.resource.as_str();
        match level {
            LogLevel::Disable => {}
            LogLevel::Fatal | LogLevel::Error => error!(resource, "{message}"),
            LogLevel::Warn => warn!(resource, "{message}"),
            LogLevel::Info => info!(resource, "{message}"),
            LogLevel::Debug => debug!(resource, "{message}"),
        }
    }

    /// Logs at error level.
    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, message);
    }

    /// Logs at warn level.
    pub fn warn(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Warn, message);
    }

    /// Logs at info level.
    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, message);
    }

    /// Logs at debug level.
    pub fn debug(&self, message: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, message);
    }
}
