//! Proxy-wasm sandbox on wasmtime.
//!
//! [`WasmMachine`] is the default [`PluginMachine`]: one wasmtime [`Store`]
//! and module instance speaking the proxy-wasm ABI.  Every callback gets a
//! fresh fuel budget and guest memory is capped by a [`StoreLimits`]
//! limiter, both taken from the module's
//! [`SandboxConfig`](crate::config::SandboxConfig).  The per-request
//! [`Exchange`] is moved into the store for the duration of a callback so
//! that host imports can read and mutate it, and moved back afterwards.

mod abi;

use std::time::Duration;

use wasmtime::{Linker, Store, StoreLimits, StoreLimitsBuilder, WasmParams, WasmResults};

use crate::bridge::CapabilityBridge;
use crate::error::{HostError, Result};
use crate::machine::{Action, Exchange, PluginMachine};
use crate::metrics::MetricKind;
use crate::module::Module;
use crate::transport::CallOutcome;

/// Context id of the plugin's root context.
pub const ROOT_CONTEXT_ID: u32 = 1;

/// A metric defined by the guest, tracked locally so `proxy_get_metric`
/// can answer without consulting the sink.
struct MetricSlot {
    name: String,
    kind: MetricKind,
    value: i64,
}

/// Data attached to the wasmtime store.
pub(crate) struct HostState {
    limits: StoreLimits,
    bridge: Option<CapabilityBridge>,
    exchange: Option<Exchange>,
    /// Outcome being delivered by `proxy_on_http_call_response`.
    call_response: Option<CallOutcome>,
    effective_context: u32,
    metrics: Vec<MetricSlot>,
    /// Set by `proxy_set_tick_period_milliseconds`; zero means no timer.
    tick_period_ms: u32,
}

impl HostState {
    fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            bridge: None,
            exchange: None,
            call_response: None,
            effective_context: ROOT_CONTEXT_ID,
            metrics: Vec::new(),
            tick_period_ms: 0,
        }
    }
}

/// A proxy-wasm module instance.
pub struct WasmMachine {
    store: Store<HostState>,
    instance: wasmtime::Instance,
    max_fuel: u64,
    next_context_id: u32,
    /// Plugin name once started, module source before.
    name: String,
}

impl WasmMachine {
    /// Instantiate `module` in a fresh store.  Imports the host does not
    /// provide are linked as traps, so they only fail if actually called.
    pub fn new(module: &Module) -> Result<Self> {
        let config = module.config();
        let name = module.source().to_owned();
        let init_err = |reason: String| HostError::Init {
            plugin: name.clone(),
            reason,
        };

        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory)
            .instances(1)
            .build();
        let mut store = Store::new(module.engine(), HostState::new(limits));
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(config.max_fuel)
            .map_err(|e| init_err(format!("failed to set fuel: {e}")))?;

        let mut linker: Linker<HostState> = Linker::new(module.engine());
        abi::define(&mut linker).map_err(|e| init_err(format!("failed to link host imports: {e}")))?;
        linker
            .define_unknown_imports_as_traps(module.wasm())
            .map_err(|e| init_err(format!("failed to link unknown imports: {e}")))?;

        let instance = linker
            .instantiate(&mut store, module.wasm())
            .map_err(|e| init_err(format!("instantiation failed: {e:#}")))?;

        tracing::debug!(module = %name, max_fuel = config.max_fuel, "wasm instance created");

        Ok(Self {
            store,
            instance,
            max_fuel: config.max_fuel,
            next_context_id: ROOT_CONTEXT_ID + 1,
            name,
        })
    }

    fn fault(&self, reason: String) -> HostError {
        HostError::PluginFault {
            plugin: self.name.clone(),
            reason,
        }
    }

    /// Call an optional export with a fresh fuel budget.  `Ok(None)` when
    /// the module does not export `name`.
    fn call<P, R>(&mut self, name: &str, params: P) -> Result<Option<R>>
    where
        P: WasmParams,
        R: WasmResults,
    {
        let Some(func) = self.instance.get_func(&mut self.store, name) else {
            return Ok(None);
        };
        let typed = func
            .typed::<P, R>(&self.store)
            .map_err(|e| self.fault(format!("export `{name}` has an unexpected signature: {e}")))?;
        self.store
            .set_fuel(self.max_fuel)
            .map_err(|e| self.fault(format!("failed to refuel: {e}")))?;
        let result = typed.call(&mut self.store, params);
        result
            .map(Some)
            .map_err(|e| self.fault(format!("`{name}` trapped: {e:#}")))
    }

    fn enter(&mut self, exchange: &mut Exchange) {
        let state = self.store.data_mut();
        state.effective_context = exchange.context_id;
        state.exchange = Some(std::mem::take(exchange));
    }

    fn leave(&mut self, exchange: &mut Exchange) {
        let state = self.store.data_mut();
        state.effective_context = ROOT_CONTEXT_ID;
        state.call_response = None;
        if let Some(ex) = state.exchange.take() {
            *exchange = ex;
        }
    }

    fn request_phases(&mut self, context_id: i32, header_count: i32, body_len: usize) -> Result<Action> {
        self.call::<(i32, i32), ()>("proxy_on_context_create", (context_id, ROOT_CONTEXT_ID as i32))?;

        let end_of_stream = i32::from(body_len == 0);
        let mut action = self
            .call::<(i32, i32, i32), i32>(
                "proxy_on_request_headers",
                (context_id, header_count, end_of_stream),
            )?
            .map_or(Action::Continue, Action::from_abi);

        let answered = self
            .store
            .data()
            .exchange
            .as_ref()
            .is_some_and(|ex| ex.local_response.is_some());
        // A paused or answered request never reaches the body phase.
        if action == Action::Continue && body_len > 0 && !answered {
            action = self
                .call::<(i32, i32, i32), i32>(
                    "proxy_on_request_body",
                    (context_id, body_len as i32, 1),
                )?
                .map_or(Action::Continue, Action::from_abi);
        }
        Ok(action)
    }
}

impl PluginMachine for WasmMachine {
    fn start(&mut self, bridge: &CapabilityBridge) -> Result<()> {
        self.name = bridge.plugin_name().to_owned();
        self.store.data_mut().bridge = Some(bridge.clone());

        let init_err = |reason: String| HostError::Init {
            plugin: bridge.plugin_name().to_owned(),
            reason,
        };

        if self.call::<(), ()>("_initialize", ())?.is_none() {
            self.call::<(), ()>("_start", ())?;
        }

        let root = ROOT_CONTEXT_ID as i32;
        self.call::<(i32, i32), ()>("proxy_on_context_create", (root, 0))?;

        if self.call::<(i32, i32), i32>("proxy_on_vm_start", (root, 0))? == Some(0) {
            return Err(init_err("proxy_on_vm_start returned false".into()));
        }

        let config_len = bridge.configuration().len() as i32;
        if self.call::<(i32, i32), i32>("proxy_on_configure", (root, config_len))? == Some(0) {
            return Err(init_err("proxy_on_configure returned false".into()));
        }

        tracing::debug!(plugin = %self.name, config_bytes = config_len, "plugin started");
        Ok(())
    }

    fn on_request(&mut self, _bridge: &CapabilityBridge, exchange: &mut Exchange) -> Result<Action> {
        let context_id = self.next_context_id;
        self.next_context_id = self.next_context_id.wrapping_add(1).max(ROOT_CONTEXT_ID + 1);
        exchange.context_id = context_id;

        let header_count = exchange.request.abi_headers().len() as i32;
        let body_len = exchange.body.len();

        self.enter(exchange);
        let result = self.request_phases(context_id as i32, header_count, body_len);
        self.leave(exchange);
        result
    }

    fn on_http_call_response(
        &mut self,
        _bridge: &CapabilityBridge,
        exchange: &mut Exchange,
        token: u32,
        outcome: &CallOutcome,
    ) -> Result<Action> {
        let (header_count, body_len) = match outcome {
            Ok(response) => (response.headers.len() + 1, response.body.len()),
            Err(_) => (0, 0),
        };

        self.enter(exchange);
        self.store.data_mut().call_response = Some(outcome.clone());
        let result = self.call::<(i32, i32, i32, i32, i32), ()>(
            "proxy_on_http_call_response",
            (
                ROOT_CONTEXT_ID as i32,
                token as i32,
                header_count as i32,
                body_len as i32,
                0,
            ),
        );
        self.leave(exchange);
        result?;

        if exchange.resumed || exchange.local_response.is_some() {
            Ok(Action::Continue)
        } else {
            Ok(Action::Pause)
        }
    }

    fn on_done(&mut self, _bridge: &CapabilityBridge, exchange: &mut Exchange) -> Result<()> {
        let context_id = exchange.context_id as i32;
        self.enter(exchange);
        let result = self
            .call::<i32, i32>("proxy_on_done", context_id)
            .and_then(|_| self.call::<i32, ()>("proxy_on_delete", context_id));
        self.leave(exchange);
        result.map(|_| ())
    }

    fn tick_period(&self) -> Option<Duration> {
        let ms = self.store.data().tick_period_ms;
        (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
    }

    fn on_tick(&mut self, _bridge: &CapabilityBridge) -> Result<()> {
        self.call::<i32, ()>("proxy_on_tick", ROOT_CONTEXT_ID as i32)?;
        Ok(())
    }
}
