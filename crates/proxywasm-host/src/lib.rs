//! Host runtime for sandboxed proxy-wasm plugins.
//!
//! This crate sits between an HTTP-serving host and one or more plugin
//! modules.  It loads each module once, creates plugin instances under a
//! declared sharing policy, and brokers every capability a sandbox needs
//! from the host.  Plugins never touch host resources directly.
//!
//! - **[`module`]** -- [`ModuleStore`] compiles each [`ModuleSource`] once and
//!   hands out cheap [`Module`] handles.
//! - **[`descriptor`]** -- [`PluginDescriptor`] is a plugin's immutable
//!   capability registry: configuration, logger, metrics sink, named
//!   upstreams and named foreign functions.
//! - **[`pool`]** -- [`InstancePool`] creates, shares, and tears down
//!   instances.  Shared plugins get one resident instance with
//!   single-flight initialization; per-request plugins get a fresh one
//!   every time.
//! - **[`bridge`]** -- [`CapabilityBridge`] is the only path from a sandbox to
//!   the outside world.
//! - **[`dispatcher`]** -- [`RequestDispatcher`] drives one request through
//!   an instance, including asynchronous outbound HTTP calls, under a time
//!   budget.
//! - **[`wasm`]** -- [`WasmMachine`] speaks the proxy-wasm ABI on wasmtime.
//!
//! Supporting modules: [`config`], [`error`], [`logging`], [`metrics`],
//! [`transport`] and [`machine`].
//!
//! All shared types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use proxywasm_host::{
//!     HostRequest, InstancePool, ModuleSource, ModuleStore, PluginDescriptor, ReqwestTransport,
//!     RequestDispatcher, RequestHead, SandboxConfig, Sharing, TracingLogHandler,
//! };
//!
//! # async fn example() -> proxywasm_host::Result<()> {
//! let config = SandboxConfig::default();
//! let modules = ModuleStore::new(config.clone())?;
//!
//! let descriptor = PluginDescriptor::builder()
//!     .with_name("headerTests")
//!     .with_module(modules.load(ModuleSource::path("plugins/main.wasm"))?)
//!     .with_sharing(Sharing::Shared)
//!     .with_logger(Arc::new(TracingLogHandler::new("headerTests")))
//!     .build()?;
//!
//! let pool = InstancePool::new(config, Arc::new(ReqwestTransport::new()));
//! pool.register(Arc::new(descriptor))?;
//!
//! let dispatcher = RequestDispatcher::new(pool);
//! let disposition = dispatcher
//!     .dispatch("headerTests", HostRequest::new(RequestHead::new("GET", "/")))
//!     .await;
//! # let _ = disposition;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod machine;
pub mod metrics;
pub mod module;
pub mod pool;
pub mod transport;
pub mod wasm;

// Re-export the most commonly used types at the crate root.
pub use bridge::{CapabilityBridge, PendingCall};
pub use config::SandboxConfig;
pub use descriptor::{ForeignFunction, PluginDescriptor, PluginDescriptorBuilder, Sharing};
pub use dispatcher::{Disposition, HostRequest, RequestDispatcher, RequestState};
pub use error::{CapabilityKind, HostError, Result};
pub use logging::{LogHandler, LogLevel, TracingLogHandler};
pub use machine::{Action, Exchange, LocalResponse, MachineFactory, PluginMachine, RequestHead};
pub use metrics::{MetricKind, MetricValue, MetricsHandler, SimpleMetricsHandler};
pub use module::{Module, ModuleSource, ModuleStore};
pub use pool::{Instance, InstanceId, InstanceInfo, InstanceLease, InstancePool};
pub use transport::{
    CallFailure, CallFailureKind, CallOutcome, HeaderList, HttpCallRequest, HttpCallResponse,
    HttpTransport, ReqwestTransport,
};
pub use wasm::WasmMachine;
