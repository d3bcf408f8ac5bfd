//! Sandbox seam.
//!
//! A [`PluginMachine`] is one initialized sandbox: the thing an
//! [`Instance`](crate::pool::Instance) drives.  The pool and dispatcher only
//! know this trait, so the wasm engine ([`WasmMachine`](crate::wasm::WasmMachine))
//! and test doubles are interchangeable.
//!
//! Callbacks are synchronous.  Anything a callback wants from the outside
//! world goes through the [`CapabilityBridge`] it is handed, and per-request
//! state lives in the [`Exchange`].

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::{CapabilityBridge, PendingCall};
use crate::error::Result;
use crate::module::Module;
use crate::transport::{CallOutcome, HeaderList};

/// What the plugin wants the host to do with the request after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Proceed to the next phase.
    Continue,
    /// Hold the request until the plugin resumes it.
    Pause,
}

impl Action {
    /// Map a proxy-wasm action code; anything but `0` pauses.
    pub fn from_abi(value: i32) -> Self {
        if value == 0 {
            Self::Continue
        } else {
            Self::Pause
        }
    }
}

/// Method, path, authority and headers of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub authority: String,
    pub headers: HeaderList,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            authority: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Headers as the sandbox sees them: pseudo-headers first.
    pub fn abi_headers(&self) -> HeaderList {
        let mut all = Vec::with_capacity(self.headers.len() + 3);
        all.push((":method".to_string(), self.method.clone()));
        all.push((":path".to_string(), self.path.clone()));
        if !self.authority.is_empty() {
            all.push((":authority".to_string(), self.authority.clone()));
        }
        all.extend(self.headers.iter().cloned());
        all
    }

    /// First value of a header, matched case-insensitively.  Pseudo-headers
    /// resolve to the corresponding field.
    pub fn header(&self, name: &str) -> Option<&str> {
        match name {
            ":method" => Some(self.method.as_str()),
            ":path" => Some(self.path.as_str()),
            ":authority" if !self.authority.is_empty() => Some(self.authority.as_str()),
            ":authority" => None,
            _ => self
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
        }
    }

    /// Append a value, keeping existing ones.
    pub fn add_header(&mut self, name: &str, value: &str) {
        if !self.set_pseudo(name, value) {
            self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    /// Replace every value of `name` with `value`.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if !self.set_pseudo(name, value) {
            self.remove_header(name);
            self.headers.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    fn set_pseudo(&mut self, name: &str, value: &str) -> bool {
        let field = match name {
            ":method" => &mut self.method,
            ":path" => &mut self.path,
            ":authority" => &mut self.authority,
            _ => return false,
        };
        *field = value.to_string();
        true
    }
}

/// A response produced by the plugin instead of forwarding the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    /// Free-form reason supplied by the plugin (`status_code_details`).
    pub details: String,
}

impl LocalResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            details: String::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The generic failure returned when a request cannot be served.
    pub fn internal_error() -> Self {
        Self::new(500).with_body("internal plugin error")
    }
}

/// Per-request state visible to the sandbox.
#[derive(Debug, Default)]
pub struct Exchange {
    /// Sandbox-side context id, assigned by the machine.
    pub context_id: u32,
    pub request: RequestHead,
    pub body: Vec<u8>,
    /// Set when the plugin answers the request itself.
    pub local_response: Option<LocalResponse>,
    /// Set when the plugin continues a paused request.
    pub resumed: bool,
    pending: Vec<PendingCall>,
}

impl Exchange {
    pub fn new(request: RequestHead, body: Vec<u8>) -> Self {
        Self {
            request,
            body,
            ..Self::default()
        }
    }

    /// An exchange that only identifies a sandbox context, used to tear
    /// that context down after the request itself is gone.
    pub fn for_context(context_id: u32) -> Self {
        Self {
            context_id,
            ..Self::default()
        }
    }

    pub(crate) fn push_pending(&mut self, call: PendingCall) {
        self.pending.push(call);
    }

    /// Calls issued during the last callback, in issue order.
    pub fn take_pending(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One initialized sandbox.
pub trait PluginMachine: Send {
    /// Run the plugin's start-up callbacks with the descriptor's
    /// configuration payload (`bridge.configuration()`).
    fn start(&mut self, bridge: &CapabilityBridge) -> Result<()>;

    /// Deliver an inbound request.
    fn on_request(&mut self, bridge: &CapabilityBridge, exchange: &mut Exchange) -> Result<Action>;

    /// Deliver the outcome of a call issued through
    /// [`CapabilityBridge::issue_http_call`].
    fn on_http_call_response(
        &mut self,
        bridge: &CapabilityBridge,
        exchange: &mut Exchange,
        token: u32,
        outcome: &CallOutcome,
    ) -> Result<Action>;

    /// The request is finished; release any per-request sandbox state.
    fn on_done(&mut self, _bridge: &CapabilityBridge, _exchange: &mut Exchange) -> Result<()> {
        Ok(())
    }

    /// Interval at which the plugin asked for [`on_tick`](Self::on_tick),
    /// if any.  Read after start and after every tick.
    fn tick_period(&self) -> Option<Duration> {
        None
    }

    /// Timer callback on the plugin's root context.
    fn on_tick(&mut self, _bridge: &CapabilityBridge) -> Result<()> {
        Ok(())
    }
}

/// Turns a compiled module into a fresh, not yet started machine.
pub type MachineFactory = Arc<dyn Fn(&Module) -> Result<Box<dyn PluginMachine>> + Send + Sync>;
