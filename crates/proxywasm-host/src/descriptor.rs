//! Plugin descriptors.
//!
//! A [`PluginDescriptor`] is the capability registry of one plugin: its
//! module, sharing mode, configuration payload, and the host capabilities
//! its instances may reach (logger, metrics sink, named upstreams, named
//! foreign functions).  It is assembled with [`PluginDescriptorBuilder`],
//! validated once in [`PluginDescriptorBuilder::build`], and immutable
//! thereafter.  Lookups are total: an unknown name is a
//! [`HostError::NotFound`], never a panic.
//!
//! # Example
//!
//! ```rust,no_run
//! # use proxywasm_host::{ModuleSource, ModuleStore, PluginDescriptor, Sharing};
//! # fn example() -> proxywasm_host::Result<()> {
//! let store = ModuleStore::with_defaults()?;
//! let module = store.load(ModuleSource::path("plugins/main.wasm"))?;
//!
//! let descriptor = PluginDescriptor::builder()
//!     .with_name("httpCallTests")
//!     .with_module(module)
//!     .with_sharing(Sharing::Shared)
//!     .with_configuration(r#"{"upstream":"web_service","path":"/ok"}"#)
//!     .with_upstream("web_service", "http://localhost:8081")
//!     .build()?;
//!
//! assert!(descriptor.resolve_upstream("web_service").is_ok());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CapabilityKind, HostError, Result};
use crate::logging::LogHandler;
use crate::machine::{MachineFactory, PluginMachine};
use crate::metrics::MetricsHandler;
use crate::module::Module;
use crate::wasm::WasmMachine;

/// A host function callable from the sandbox by name.  Bytes in, bytes out.
pub type ForeignFunction = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Instance sharing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sharing {
    /// One instance serves every request, one request at a time.
    Shared,
    /// Every request gets its own instance.
    #[default]
    PerRequest,
}

/// Immutable description of one plugin and its capabilities.
pub struct PluginDescriptor {
    name: String,
    module: Module,
    sharing: Sharing,
    configuration: Vec<u8>,
    logger: Option<Arc<dyn LogHandler>>,
    metrics: Option<Arc<dyn MetricsHandler>>,
    upstreams: HashMap<String, Url>,
    foreign_functions: HashMap<String, ForeignFunction>,
    machine_factory: MachineFactory,
}

impl PluginDescriptor {
    pub fn builder() -> PluginDescriptorBuilder {
        PluginDescriptorBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    pub fn is_shared(&self) -> bool {
        self.sharing == Sharing::Shared
    }

    /// Opaque payload handed to the plugin's start callback.
    pub fn configuration(&self) -> &[u8] {
        &self.configuration
    }

    pub fn logger(&self) -> Option<&Arc<dyn LogHandler>> {
        self.logger.as_ref()
    }

    pub fn metrics(&self) -> Option<&Arc<dyn MetricsHandler>> {
        self.metrics.as_ref()
    }

    /// Network target registered under `name`.
    pub fn resolve_upstream(&self, name: &str) -> Result<&Url> {
        self.upstreams
            .get(name)
            .ok_or_else(|| HostError::not_found(CapabilityKind::Upstream, name))
    }

    /// Host function registered under `name`.
    pub fn resolve_function(&self, name: &str) -> Result<&ForeignFunction> {
        self.foreign_functions
            .get(name)
            .ok_or_else(|| HostError::not_found(CapabilityKind::ForeignFunction, name))
    }

    /// Registered upstream names, sorted.
    pub fn upstream_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.upstreams.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered foreign function names, sorted.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.foreign_functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a fresh, not yet started machine for this plugin.
    pub fn create_machine(&self) -> Result<Box<dyn PluginMachine>> {
        (self.machine_factory)(&self.module)
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("sharing", &self.sharing)
            .field("configuration_bytes", &self.configuration.len())
            .field("logger", &self.logger.is_some())
            .field("metrics", &self.metrics.is_some())
            .field("upstreams", &self.upstream_names())
            .field("foreign_functions", &self.function_names())
            .finish()
    }
}

/// Accumulates descriptor settings; nothing is validated until [`build`].
///
/// [`build`]: PluginDescriptorBuilder::build
#[derive(Default)]
pub struct PluginDescriptorBuilder {
    name: Option<String>,
    module: Option<Module>,
    sharing: Sharing,
    configuration: Vec<u8>,
    logger: Option<Arc<dyn LogHandler>>,
    metrics: Option<Arc<dyn MetricsHandler>>,
    upstreams: Vec<(String, String)>,
    foreign_functions: Vec<(String, ForeignFunction)>,
    machine_factory: Option<MachineFactory>,
}

impl PluginDescriptorBuilder {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    /// `true` selects [`Sharing::Shared`], `false` [`Sharing::PerRequest`].
    pub fn with_shared(self, shared: bool) -> Self {
        self.with_sharing(if shared {
            Sharing::Shared
        } else {
            Sharing::PerRequest
        })
    }

    pub fn with_configuration(mut self, configuration: impl Into<Vec<u8>>) -> Self {
        self.configuration = configuration.into();
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn LogHandler>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_metrics_handler(mut self, metrics: Arc<dyn MetricsHandler>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register an upstream; the target is parsed in [`build`](Self::build).
    pub fn with_upstream(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.upstreams.push((name.into(), target.into()));
        self
    }

    pub fn with_upstreams<I, K, V>(mut self, upstreams: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.upstreams
            .extend(upstreams.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_foreign_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.foreign_functions
            .push((name.into(), Arc::new(function)));
        self
    }

    pub fn with_foreign_functions<I, K>(mut self, functions: I) -> Self
    where
        I: IntoIterator<Item = (K, ForeignFunction)>,
        K: Into<String>,
    {
        self.foreign_functions
            .extend(functions.into_iter().map(|(k, f)| (k.into(), f)));
        self
    }

    /// Override how machines are created.  Defaults to [`WasmMachine`].
    pub fn with_machine_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Module) -> Result<Box<dyn PluginMachine>> + Send + Sync + 'static,
    {
        self.machine_factory = Some(Arc::new(factory));
        self
    }

    /// Validate and freeze the descriptor.
    pub fn build(self) -> Result<PluginDescriptor> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| HostError::Config("plugin name must not be empty".into()))?;

        let module = self
            .module
            .ok_or_else(|| HostError::Config(format!("plugin `{name}` has no module")))?;

        let mut upstreams = HashMap::with_capacity(self.upstreams.len());
        for (upstream, target) in self.upstreams {
            if upstream.is_empty() {
                return Err(HostError::Config(format!(
                    "plugin `{name}` has an upstream with an empty name"
                )));
            }
            let url = parse_upstream(&target).map_err(|reason| {
                HostError::Config(format!(
                    "plugin `{name}` upstream `{upstream}` has invalid target `{target}`: {reason}"
                ))
            })?;
            upstreams.insert(upstream, url);
        }

        let mut foreign_functions = HashMap::with_capacity(self.foreign_functions.len());
        for (function, f) in self.foreign_functions {
            if function.is_empty() {
                return Err(HostError::Config(format!(
                    "plugin `{name}` has a foreign function with an empty name"
                )));
            }
            foreign_functions.insert(function, f);
        }

        let machine_factory = self.machine_factory.unwrap_or_else(wasm_machine_factory);

        tracing::debug!(
            plugin = %name,
            sharing = ?self.sharing,
            upstreams = upstreams.len(),
            foreign_functions = foreign_functions.len(),
            "plugin descriptor built"
        );

        Ok(PluginDescriptor {
            name,
            module,
            sharing: self.sharing,
            configuration: self.configuration,
            logger: self.logger,
            metrics: self.metrics,
            upstreams,
            foreign_functions,
            machine_factory,
        })
    }
}

fn wasm_machine_factory() -> MachineFactory {
    Arc::new(|module: &Module| {
        let machine = WasmMachine::new(module)?;
        Ok(Box::new(machine) as Box<dyn PluginMachine>)
    })
}

fn parse_upstream(target: &str) -> std::result::Result<Url, String> {
    let url = Url::parse(target).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme `{}`", url.scheme()));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".into());
    }
    Ok(url)
}
