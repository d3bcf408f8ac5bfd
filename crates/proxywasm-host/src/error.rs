//! Host error types.
//!
//! Every subsystem surfaces failures through [`HostError`].  The variants
//! follow the lifecycle in which they occur: setup-time errors (`Load`,
//! `Config`) abort one plugin's availability, request-time errors either
//! resolve inside the plugin (`NotFound`, `CallFailed`) or terminate the
//! request (`Init`, `Stalled`, `PluginFault`, `Timeout`).  A `CallFailed`
//! that reaches the host means the plugin did not recover from it.  Only
//! `PluginFault` costs the instance itself; none of them is fatal to the
//! host process.

use std::fmt;

/// What kind of name failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// A named outbound network target.
    Upstream,
    /// A named host function.
    ForeignFunction,
    /// A plugin descriptor registered with the pool.
    Plugin,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Upstream => "upstream",
            Self::ForeignFunction => "foreign function",
            Self::Plugin => "plugin",
        };
        f.write_str(s)
    }
}

/// Unified error type for the plugin host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The module source was unreadable or its bytes did not compile.
    #[error("failed to load module `{source_name}`: {reason}")]
    Load {
        /// Display form of the [`ModuleSource`](crate::module::ModuleSource).
        source_name: String,
        /// Underlying compiler or I/O message.
        reason: String,
    },

    /// A descriptor or pool was set up with invalid values.
    #[error("configuration error: {0}")]
    Config(String),

    /// The plugin's start callback failed.
    #[error("plugin `{plugin}` failed to initialize: {reason}")]
    Init { plugin: String, reason: String },

    /// A name looked up in the capability registry does not exist.
    #[error("{kind} not found: `{name}`")]
    NotFound { kind: CapabilityKind, name: String },

    /// An outbound call to an upstream failed at the transport and the
    /// plugin left the request paused instead of handling it.
    #[error("call to upstream `{upstream}` failed: {reason}")]
    CallFailed { upstream: String, reason: String },

    /// The plugin paused the request with nothing left to resume it.
    #[error("plugin `{plugin}` paused the request with no outstanding calls")]
    Stalled { plugin: String },

    /// The sandbox trapped or a callback reported an error.
    #[error("plugin `{plugin}` faulted: {reason}")]
    PluginFault { plugin: String, reason: String },

    /// The request exceeded its time budget.
    #[error("timeout: request exceeded {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    /// An I/O error occurred (e.g. reading a `.wasm` file from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Shorthand for a [`HostError::NotFound`].
    pub fn not_found(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the instance that produced this error is unusable.  Logical
    /// failures (a stalled request, an unhandled call failure) leave the
    /// instance and its plugin state intact.
    pub fn faults_instance(&self) -> bool {
        matches!(self, Self::PluginFault { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HostError>;
