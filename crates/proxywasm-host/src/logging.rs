//! Log capability.
//!
//! Plugins emit log lines through [`LogHandler`].  [`TracingLogHandler`] is
//! the system handler: it forwards plugin messages into `tracing` tagged with
//! the plugin name, the same way host-side events are logged.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a plugin log line, in proxy-wasm order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Critical = 5,
}

impl LogLevel {
    /// Map an ABI level to a [`LogLevel`].  Unknown values clamp to
    /// `Critical`.
    pub fn from_abi(value: i32) -> Self {
        match value {
            i32::MIN..=0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            4 => Self::Error,
            _ => Self::Critical,
        }
    }

    pub fn as_abi(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Receives log lines emitted by plugin instances.
pub trait LogHandler: Send + Sync {
    /// Lowest level the handler is interested in.  Plugins query this to
    /// skip formatting messages that would be discarded.
    fn level(&self) -> LogLevel {
        LogLevel::Trace
    }

    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards plugin log lines to `tracing`.
#[derive(Debug, Clone)]
pub struct TracingLogHandler {
    plugin: String,
    level: LogLevel,
}

impl TracingLogHandler {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            level: LogLevel::Trace,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

impl LogHandler for TracingLogHandler {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn log(&self, level: LogLevel, message: &str) {
        if level < self.level {
            return;
        }
        let plugin = self.plugin.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(plugin, plugin_msg = message),
            LogLevel::Debug => tracing::debug!(plugin, plugin_msg = message),
            LogLevel::Info => tracing::info!(plugin, plugin_msg = message),
            LogLevel::Warn => tracing::warn!(plugin, plugin_msg = message),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(plugin, critical = level == LogLevel::Critical, plugin_msg = message)
            }
        }
    }
}
