//! Request dispatcher.
//!
//! Drives one inbound request through a plugin instance:
//!
//! ```text
//! Received --> InstanceAcquired --> Executing --> Completed --> InstanceReleased
//!          \                                 \-> Failed   --/
//!           \-> Failed (acquire error)
//! ```
//!
//! While executing, the plugin may pause the request and issue outbound
//! calls through its [`CapabilityBridge`].  The dispatcher runs those calls
//! concurrently, delivers each completion to the plugin under its own token
//! in whatever order they finish, and stops waiting as soon as the plugin
//! answers locally or resumes the request.  The instance lock is only held
//! while a callback runs, never while a call is in flight.
//!
//! The whole request runs under [`SandboxConfig::request_timeout`].  When it
//! expires the request future is dropped: in-flight calls are cancelled and
//! the instance lease is released by its destructor.  The request's sandbox
//! context is still closed with `on_done`, from a background task, unless the
//! instance faulted.
//!
//! Calls still outstanding when a request completes normally are left to
//! finish in the background; their responses are discarded.
//!
//! [`SandboxConfig::request_timeout`]: crate::config::SandboxConfig::request_timeout

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;

use crate::bridge::CapabilityBridge;
use crate::descriptor::{PluginDescriptor, Sharing};
use crate::error::{CapabilityKind, HostError, Result};
use crate::machine::{Action, Exchange, LocalResponse, PluginMachine, RequestHead};
use crate::pool::{Instance, InstanceLease, InstancePool};
use crate::transport::CallOutcome;

/// An inbound request as handed over by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRequest {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

impl HostRequest {
    pub fn new(head: RequestHead) -> Self {
        Self {
            head,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// What the host should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Forward the (possibly modified) request upstream.
    Continue { request: RequestHead, body: Vec<u8> },
    /// Answer the client directly.
    Respond(LocalResponse),
}

impl Disposition {
    /// The local response, if the plugin produced one.
    pub fn response(&self) -> Option<&LocalResponse> {
        match self {
            Self::Respond(response) => Some(response),
            Self::Continue { .. } => None,
        }
    }

    fn from_exchange(exchange: Exchange) -> Self {
        match exchange.local_response {
            Some(response) => Self::Respond(response),
            None => Self::Continue {
                request: exchange.request,
                body: exchange.body,
            },
        }
    }
}

/// Dispatch states, logged at debug level as a request moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Received,
    InstanceAcquired,
    Executing,
    Completed,
    Failed,
    InstanceReleased,
}

type InFlight = FuturesUnordered<BoxFuture<'static, (u32, CallOutcome)>>;

/// Routes inbound requests to plugin instances.
#[derive(Debug, Clone)]
pub struct RequestDispatcher {
    pool: InstancePool,
}

impl RequestDispatcher {
    #[must_use]
    pub fn new(pool: InstancePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Run `request` through the named plugin.  Never fails: any error is
    /// logged and turned into a generic 500 response.
    pub async fn dispatch(&self, plugin: &str, request: HostRequest) -> Disposition {
        match self.try_dispatch(plugin, request).await {
            Ok(disposition) => disposition,
            Err(e) => {
                tracing::warn!(plugin, error = %e, "request failed, answering with 500");
                Disposition::Respond(LocalResponse::internal_error())
            }
        }
    }

    /// Run `request` through the named plugin, surfacing errors.
    pub async fn try_dispatch(&self, plugin: &str, request: HostRequest) -> Result<Disposition> {
        let descriptor = self
            .pool
            .descriptor(plugin)
            .ok_or_else(|| HostError::not_found(CapabilityKind::Plugin, plugin))?;
        self.try_dispatch_to(&descriptor, request).await
    }

    /// Run `request` through a descriptor that need not be registered.
    pub async fn try_dispatch_to(
        &self,
        descriptor: &Arc<PluginDescriptor>,
        request: HostRequest,
    ) -> Result<Disposition> {
        let limit = self.pool.config().request_timeout();
        match tokio::time::timeout(limit, self.run(descriptor, request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    plugin = descriptor.name(),
                    limit_ms = limit.as_millis() as u64,
                    "request timed out"
                );
                Err(HostError::Timeout {
                    limit_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn run(
        &self,
        descriptor: &Arc<PluginDescriptor>,
        request: HostRequest,
    ) -> Result<Disposition> {
        let plugin = descriptor.name();
        transition(plugin, None, RequestState::Received);

        let lease = match self.pool.acquire(descriptor).await {
            Ok(lease) => lease,
            Err(e) => {
                transition(plugin, None, RequestState::Failed);
                return Err(e);
            }
        };
        let instance = lease.id();
        transition(plugin, Some(instance), RequestState::InstanceAcquired);

        // Declared after the lease so it drops first.  It stays armed until
        // `on_done` has started, which clears the context slot.
        let mut teardown = ContextTeardown::new(lease.instance());
        let outcome = match execute(&lease, request, teardown.slot()).await {
            Ok(exchange) => finish(&lease, exchange, teardown.slot())
                .await
                .map(Disposition::from_exchange),
            Err(e) if e.faults_instance() => Err(e),
            Err(e) => {
                if let Some(context_id) = teardown.context_id() {
                    let closing = Exchange::for_context(context_id);
                    if let Err(fault) = finish(&lease, closing, teardown.slot()).await {
                        tracing::warn!(plugin, instance, error = %fault, "context teardown failed");
                        lease.mark_faulted();
                    }
                }
                Err(e)
            }
        };
        teardown.disarm();

        match &outcome {
            Ok(_) => transition(plugin, Some(instance), RequestState::Completed),
            Err(e) => {
                if e.faults_instance() {
                    lease.mark_faulted();
                }
                transition(plugin, Some(instance), RequestState::Failed);
            }
        }

        drop(teardown);
        drop(lease);
        transition(plugin, Some(instance), RequestState::InstanceReleased);
        outcome
    }
}

/// Sentinel for "no sandbox context created yet".
const NO_CONTEXT: u64 = u64::MAX;

/// Closes the request's sandbox context when the request future is dropped
/// before it could do so itself.
struct ContextTeardown {
    instance: Arc<Instance>,
    context: Arc<AtomicU64>,
    armed: bool,
}

impl ContextTeardown {
    fn new(instance: &Arc<Instance>) -> Self {
        Self {
            instance: Arc::clone(instance),
            context: Arc::new(AtomicU64::new(NO_CONTEXT)),
            armed: true,
        }
    }

    fn slot(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.context)
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn context_id(&self) -> Option<u32> {
        read_context(&self.context)
    }
}

impl Drop for ContextTeardown {
    fn drop(&mut self) {
        if !self.armed || self.instance.is_faulted() || self.instance.sharing() == Sharing::PerRequest {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let instance = Arc::clone(&self.instance);
        let context = Arc::clone(&self.context);

        handle.spawn(async move {
            // The context id is read under the instance lock: a callback that
            // outlived the request may still be about to record it.
            let closed = instance
                .call(move |machine, bridge| match read_context(&context) {
                    Some(id) => machine
                        .on_done(bridge, &mut Exchange::for_context(id))
                        .map(|()| Some(id)),
                    None => Ok(None),
                })
                .await
                .and_then(|r| r);
            match closed {
                Ok(Some(context)) => tracing::debug!(
                    plugin = instance.plugin_name(),
                    instance = instance.id(),
                    context,
                    "abandoned request context closed"
                ),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        plugin = instance.plugin_name(),
                        instance = instance.id(),
                        error = %e,
                        "closing abandoned request context failed"
                    );
                    if e.faults_instance() {
                        instance.mark_faulted();
                    }
                }
            }
        });
    }
}

fn read_context(slot: &AtomicU64) -> Option<u32> {
    match slot.load(Ordering::Acquire) {
        NO_CONTEXT => None,
        id => u32::try_from(id).ok(),
    }
}

/// Run the plugin up to the point where the request is answered or resumed.
/// The sandbox context id is recorded in `context` as soon as it exists.
async fn execute(lease: &InstanceLease, request: HostRequest, context: Arc<AtomicU64>) -> Result<Exchange> {
    let plugin = lease.plugin_name();
    transition(plugin, Some(lease.id()), RequestState::Executing);

    let exchange = Exchange::new(request.head, request.body);
    let (mut exchange, action) = enter(lease, exchange, move |machine, bridge, ex| {
        let action = machine.on_request(bridge, ex);
        if ex.context_id != 0 {
            context.store(u64::from(ex.context_id), Ordering::Release);
        }
        action
    })
    .await?;
    let mut action = action?;

    let mut in_flight = InFlight::new();
    let mut upstreams = HashMap::new();
    launch(lease.bridge(), &mut exchange, &mut in_flight, &mut upstreams);

    // Most recent transport failure the plugin was told about, cleared by
    // any successful delivery.
    let mut last_failure: Option<(String, String)> = None;

    while action == Action::Pause && exchange.local_response.is_none() && !exchange.resumed {
        let Some((token, outcome)) = in_flight.next().await else {
            return Err(match last_failure {
                Some((upstream, reason)) => HostError::CallFailed { upstream, reason },
                None => HostError::Stalled {
                    plugin: plugin.to_owned(),
                },
            });
        };
        let upstream = upstreams.remove(&token).unwrap_or_default();
        tracing::debug!(
            plugin,
            instance = lease.id(),
            token,
            upstream = %upstream,
            ok = outcome.is_ok(),
            "delivering http call response"
        );
        last_failure = outcome.as_ref().err().map(|failure| (upstream, failure.to_string()));

        let (next_exchange, next_action) = enter(lease, exchange, move |machine, bridge, ex| {
            machine.on_http_call_response(bridge, ex, token, &outcome)
        })
        .await?;
        exchange = next_exchange;
        action = next_action?;
        launch(lease.bridge(), &mut exchange, &mut in_flight, &mut upstreams);
    }

    if !in_flight.is_empty() {
        tracing::debug!(
            plugin,
            instance = lease.id(),
            detached = in_flight.len(),
            "outstanding http calls left to finish in the background"
        );
        tokio::spawn(drain(plugin.to_owned(), in_flight));
    }

    Ok(exchange)
}

/// Close the request's sandbox context.  A failing `on_done` is logged and,
/// if it faulted, retires the instance; the request itself still stands.
async fn finish(lease: &InstanceLease, exchange: Exchange, context: Arc<AtomicU64>) -> Result<Exchange> {
    let context_id = exchange.context_id;
    let (exchange, done) = enter(lease, exchange, move |machine, bridge, ex| {
        context.store(NO_CONTEXT, Ordering::Release);
        machine.on_done(bridge, ex)
    })
    .await?;
    if let Err(e) = done {
        tracing::warn!(
            plugin = lease.plugin_name(),
            instance = lease.id(),
            context = context_id,
            error = %e,
            "on_done failed"
        );
        if e.faults_instance() {
            lease.mark_faulted();
        }
    }
    Ok(exchange)
}

/// Await calls nobody is waiting for any more.
async fn drain(plugin: String, mut in_flight: InFlight) {
    while let Some((token, outcome)) = in_flight.next().await {
        tracing::debug!(
            plugin = %plugin,
            token,
            ok = outcome.is_ok(),
            "detached http call finished"
        );
    }
}

/// Run one callback with the exchange moved into the instance and back.
async fn enter<T, F>(
    lease: &InstanceLease,
    mut exchange: Exchange,
    f: F,
) -> Result<(Exchange, Result<T>)>
where
    F: FnOnce(&mut dyn PluginMachine, &CapabilityBridge, &mut Exchange) -> Result<T>
        + Send
        + 'static,
    T: Send + 'static,
{
    lease
        .call(move |machine, bridge| {
            let outcome = f(machine, bridge, &mut exchange);
            (exchange, outcome)
        })
        .await
}

fn launch(
    bridge: &CapabilityBridge,
    exchange: &mut Exchange,
    in_flight: &mut InFlight,
    upstreams: &mut HashMap<u32, String>,
) {
    for call in exchange.take_pending() {
        upstreams.insert(call.token, call.upstream.clone());
        in_flight.push(bridge.perform_call(call));
    }
}

fn transition(plugin: &str, instance: Option<u64>, state: RequestState) {
    tracing::debug!(plugin, instance, state = ?state, "request state");
}
