//! Instance pool.
//!
//! The [`InstancePool`] owns every plugin instance and applies each
//! descriptor's sharing policy:
//!
//! - **Shared**: one resident instance per plugin name.  Concurrent first
//!   acquires coalesce into a single initialization; every waiter receives
//!   the same instance or the same [`HostError::Init`].  The instance is
//!   reference counted and stays resident when the count drops to zero.
//! - **PerRequest**: every acquire creates and starts a fresh instance, torn
//!   down when its lease is released.
//!
//! # Instance lifecycle
//!
//! ```text
//! Creating --> Started --> Leased <--> Idle (Shared only) --> Evicted
//!          \-> Failed (Init error, nothing cached)
//! ```
//!
//! Leases are RAII: dropping an [`InstanceLease`] is the release, so a
//! request that is cancelled or times out can never leak a reference.
//!
//! Shared initialization runs in its own spawned task.  A waiter that is
//! cancelled mid-initialization therefore cannot abort the initialization
//! the other waiters depend on.
//!
//! # Tick timers
//!
//! A shared instance whose plugin set a tick period during start gets a
//! timer task that calls [`PluginMachine::on_tick`] under the instance lock.
//! The timer holds only a weak reference, so it stops once the instance is
//! evicted or the pool is dropped.  Ticks do not count as activity for idle
//! eviction.  Per-request instances never tick.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::CapabilityBridge;
use crate::config::SandboxConfig;
use crate::descriptor::{PluginDescriptor, Sharing};
use crate::error::{CapabilityKind, HostError, Result};
use crate::machine::PluginMachine;
use crate::transport::HttpTransport;

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Process-unique, monotonically assigned instance identifier.
pub type InstanceId = u64;

/// One running sandbox bound to exactly one descriptor.
pub struct Instance {
    id: InstanceId,
    descriptor: Arc<PluginDescriptor>,
    bridge: CapabilityBridge,
    machine: Arc<Mutex<Box<dyn PluginMachine>>>,
    refs: AtomicUsize,
    epoch: Instant,
    /// Milliseconds after `epoch` of the last callback or release.
    last_active_ms: AtomicU64,
    faulted: AtomicBool,
    live: Arc<AtomicUsize>,
    /// Tick period the plugin asked for during start.
    tick_period: Option<Duration>,
}

impl Instance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn plugin_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn sharing(&self) -> Sharing {
        self.descriptor.sharing()
    }

    pub fn bridge(&self) -> &CapabilityBridge {
        &self.bridge
    }

    /// Outstanding leases.  Always zero or one for per-request instances.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Time since the instance last ran a callback or was released.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Run one machine callback.
    ///
    /// Callbacks on the same instance are serialized by the instance lock,
    /// which is held only for the duration of `f`.  The callback runs on the
    /// blocking thread pool because sandbox execution is CPU-bound.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn PluginMachine, &CapabilityBridge) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run(true, f).await
    }

    async fn run<F, R>(&self, touch: bool, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn PluginMachine, &CapabilityBridge) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut machine = Arc::clone(&self.machine).lock_owned().await;
        let bridge = self.bridge.clone();
        if touch {
            self.touch();
        }
        let result = tokio::task::spawn_blocking(move || f(&mut **machine, &bridge)).await;
        if touch {
            self.touch();
        }
        result.map_err(|e| HostError::PluginFault {
            plugin: self.plugin_name().to_owned(),
            reason: format!("callback aborted: {e}"),
        })
    }

    /// Flag the instance as unusable.  A faulted shared instance is dropped
    /// from the pool when its lease is released.
    pub(crate) fn mark_faulted(&self) {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                plugin = self.plugin_name(),
                instance = self.id,
                "instance marked faulted"
            );
        }
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_active_ms.store(now, Ordering::Relaxed);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(plugin = self.plugin_name(), instance = self.id, "instance destroyed");
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("plugin", &self.plugin_name())
            .field("sharing", &self.sharing())
            .field("refs", &self.ref_count())
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

/// Point-in-time view of a resident shared instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub id: InstanceId,
    pub plugin: String,
    pub ref_count: usize,
    pub init_count: u64,
    pub idle_for: Duration,
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive claim on one reference to an instance.  Dropping the lease
/// releases it.
pub struct InstanceLease {
    instance: Arc<Instance>,
    pool: InstancePool,
}

impl InstanceLease {
    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    pub fn id(&self) -> InstanceId {
        self.instance.id
    }
}

impl std::ops::Deref for InstanceLease {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.pool.inner.release_instance(&self.instance);
    }
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InstanceLease").field(&self.instance).finish()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

type InitFuture = Shared<BoxFuture<'static, std::result::Result<Arc<Instance>, String>>>;

enum SharedSlot {
    Initializing(InitFuture),
    Ready(Arc<Instance>),
}

/// Owner of every plugin instance.
///
/// Cheaply cloneable; clones share the same instances.
#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: SandboxConfig,
    transport: Arc<dyn HttpTransport>,
    descriptors: DashMap<String, Arc<PluginDescriptor>>,
    shared: DashMap<String, SharedSlot>,
    next_id: AtomicU64,
    init_counts: DashMap<String, u64>,
    live: Arc<AtomicUsize>,
}

impl InstancePool {
    #[must_use]
    pub fn new(config: SandboxConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                transport,
                descriptors: DashMap::new(),
                shared: DashMap::new(),
                next_id: AtomicU64::new(1),
                init_counts: DashMap::new(),
                live: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    // -- registry --------------------------------------------------------

    /// Register a descriptor under its name.
    pub fn register(&self, descriptor: Arc<PluginDescriptor>) -> Result<()> {
        match self.inner.descriptors.entry(descriptor.name().to_owned()) {
            Entry::Occupied(_) => Err(HostError::Config(format!(
                "plugin `{}` is already registered",
                descriptor.name()
            ))),
            Entry::Vacant(entry) => {
                tracing::info!(
                    plugin = descriptor.name(),
                    sharing = ?descriptor.sharing(),
                    module = descriptor.module().source(),
                    "plugin registered"
                );
                entry.insert(descriptor);
                Ok(())
            }
        }
    }

    pub fn descriptor(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.inner.descriptors.get(name).map(|d| Arc::clone(d.value()))
    }

    /// Registered plugin names, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .descriptors
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort_unstable();
        names
    }

    // -- acquire / release -----------------------------------------------

    /// Acquire an instance of a registered plugin.
    pub async fn acquire_by_name(&self, name: &str) -> Result<InstanceLease> {
        let descriptor = self
            .descriptor(name)
            .ok_or_else(|| HostError::not_found(CapabilityKind::Plugin, name))?;
        self.acquire(&descriptor).await
    }

    /// Acquire an instance according to the descriptor's sharing policy.
    pub async fn acquire(&self, descriptor: &Arc<PluginDescriptor>) -> Result<InstanceLease> {
        match descriptor.sharing() {
            Sharing::Shared => self.acquire_shared(descriptor).await,
            Sharing::PerRequest => {
                let instance = Arc::new(
                    Arc::clone(&self.inner)
                        .create_instance(Arc::clone(descriptor))
                        .await?,
                );
                instance.retain();
                Ok(self.lease(instance))
            }
        }
    }

    /// Give a lease back.  Equivalent to dropping it.
    pub fn release(&self, lease: InstanceLease) {
        drop(lease);
    }

    async fn acquire_shared(&self, descriptor: &Arc<PluginDescriptor>) -> Result<InstanceLease> {
        let name = descriptor.name();
        let init = match self.inner.shared.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => match entry.get() {
                SharedSlot::Ready(instance) if !instance.is_faulted() => {
                    instance.retain();
                    tracing::trace!(plugin = name, instance = instance.id, "shared instance reused");
                    return Ok(self.lease(Arc::clone(instance)));
                }
                SharedSlot::Initializing(init) => init.clone(),
                SharedSlot::Ready(stale) => {
                    // Still leased elsewhere; its release will not touch the
                    // replacement.
                    tracing::warn!(
                        plugin = name,
                        instance = stale.id,
                        "faulted shared instance replaced"
                    );
                    let init = self.spawn_shared_init(Arc::clone(descriptor));
                    entry.insert(SharedSlot::Initializing(init.clone()));
                    init
                }
            },
            Entry::Vacant(entry) => {
                let init = self.spawn_shared_init(Arc::clone(descriptor));
                entry.insert(SharedSlot::Initializing(init.clone()));
                init
            }
        };

        match init.await {
            Ok(instance) => {
                instance.retain();
                Ok(self.lease(instance))
            }
            Err(reason) => Err(HostError::Init {
                plugin: name.to_owned(),
                reason,
            }),
        }
    }

    fn spawn_shared_init(&self, descriptor: Arc<PluginDescriptor>) -> InitFuture {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let name = descriptor.name().to_owned();
            match Arc::clone(&inner).create_instance(descriptor).await {
                Ok(instance) => {
                    let instance = Arc::new(instance);
                    if let Some(period) = instance.tick_period {
                        start_ticker(&instance, period);
                    }
                    inner
                        .shared
                        .insert(name, SharedSlot::Ready(Arc::clone(&instance)));
                    Ok(instance)
                }
                Err(e) => {
                    inner.shared.remove(&name);
                    Err(match e {
                        HostError::Init { reason, .. } => reason,
                        other => other.to_string(),
                    })
                }
            }
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(format!("initialization task aborted: {e}")))
        }
        .boxed()
        .shared()
    }

    fn lease(&self, instance: Arc<Instance>) -> InstanceLease {
        InstanceLease {
            instance,
            pool: self.clone(),
        }
    }

    // -- eviction --------------------------------------------------------

    /// Drop shared instances with no outstanding leases that have been idle
    /// longer than `idle_eviction_ms`.  Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let Some(threshold) = self.inner.config.idle_eviction() else {
            return 0;
        };
        let mut evicted = 0;
        self.inner.shared.retain(|name, slot| match slot {
            SharedSlot::Ready(instance)
                if instance.ref_count() == 0 && instance.idle_for() >= threshold =>
            {
                tracing::info!(
                    plugin = %name,
                    instance = instance.id,
                    idle_ms = instance.idle_for().as_millis() as u64,
                    "idle shared instance evicted"
                );
                evicted += 1;
                false
            }
            _ => true,
        });
        evicted
    }

    /// Spawn a background sweep calling [`evict_idle`](Self::evict_idle).
    ///
    /// Returns `None` when idle eviction is disabled.  The sweep stops once
    /// every clone of the pool has been dropped.
    pub fn start_evictor(&self) -> Option<JoinHandle<()>> {
        let threshold = self.inner.config.idle_eviction()?;
        let period = (threshold / 2).max(Duration::from_millis(10));
        let pool = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            tracing::info!(period_ms = period.as_millis() as u64, "instance evictor started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                InstancePool { inner }.evict_idle();
            }
            tracing::info!("instance evictor stopped");
        }))
    }

    // -- introspection ---------------------------------------------------

    /// The resident shared instance for `name`, if initialized.
    pub fn shared_instance(&self, name: &str) -> Option<InstanceInfo> {
        let slot = self.inner.shared.get(name)?;
        match slot.value() {
            SharedSlot::Ready(instance) => Some(InstanceInfo {
                id: instance.id,
                plugin: name.to_owned(),
                ref_count: instance.ref_count(),
                init_count: self.init_count(name),
                idle_for: instance.idle_for(),
            }),
            SharedSlot::Initializing(_) => None,
        }
    }

    /// Instances currently alive, shared and per-request.
    pub fn live_instances(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// How many initializations have been attempted for `name`.
    pub fn init_count(&self, name: &str) -> u64 {
        self.inner.init_counts.get(name).map_or(0, |c| *c.value())
    }
}

impl fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("plugins", &self.plugin_names())
            .field("shared", &self.inner.shared.len())
            .field("live", &self.live_instances())
            .finish()
    }
}

impl PoolInner {
    /// Create and start one instance.  Every failure is reported as
    /// [`HostError::Init`].
    async fn create_instance(self: Arc<Self>, descriptor: Arc<PluginDescriptor>) -> Result<Instance> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let plugin = descriptor.name().to_owned();
        *self.init_counts.entry(plugin.clone()).or_insert(0) += 1;

        let bridge = CapabilityBridge::new(
            Arc::clone(&descriptor),
            Arc::clone(&self.transport),
            self.config.http_call_timeout(),
        );

        let started = std::time::Instant::now();
        let task_descriptor = Arc::clone(&descriptor);
        let task_bridge = bridge.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<(Box<dyn PluginMachine>, Option<Duration>)> {
            let mut machine = task_descriptor.create_machine()?;
            machine.start(&task_bridge)?;
            let tick_period = machine.tick_period();
            Ok((machine, tick_period))
        })
        .await;

        let (machine, tick_period) = match outcome {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                let reason = match e {
                    HostError::Init { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(plugin = %plugin, instance = id, error = %reason, "instance initialization failed");
                return Err(HostError::Init { plugin, reason });
            }
            Err(join) => {
                let reason = format!("initialization aborted: {join}");
                tracing::error!(plugin = %plugin, instance = id, error = %reason, "instance initialization failed");
                return Err(HostError::Init { plugin, reason });
            }
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        tracing::info!(
            plugin = %plugin,
            instance = id,
            sharing = ?descriptor.sharing(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "instance initialized"
        );

        Ok(Instance {
            id,
            descriptor,
            bridge,
            machine: Arc::new(Mutex::new(machine)),
            refs: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            live: Arc::clone(&self.live),
            tick_period,
        })
    }

    fn release_instance(&self, instance: &Arc<Instance>) {
        let remaining = instance.refs.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        instance.touch();

        match instance.sharing() {
            Sharing::Shared => {
                tracing::trace!(
                    plugin = instance.plugin_name(),
                    instance = instance.id,
                    remaining,
                    "shared instance released"
                );
                if instance.is_faulted() {
                    let removed = self.shared.remove_if(instance.plugin_name(), |_, slot| {
                        matches!(slot, SharedSlot::Ready(resident) if resident.id == instance.id)
                    });
                    if removed.is_some() {
                        tracing::warn!(
                            plugin = instance.plugin_name(),
                            instance = instance.id,
                            "faulted shared instance removed from pool"
                        );
                    }
                }
            }
            Sharing::PerRequest => {
                tracing::debug!(
                    plugin = instance.plugin_name(),
                    instance = instance.id,
                    "per-request instance released"
                );
            }
        }
    }
}

/// Drive `on_tick` for a shared instance until it is dropped, faults, or
/// clears its tick period.
fn start_ticker(instance: &Arc<Instance>, period: Duration) {
    let weak = Arc::downgrade(instance);
    let plugin = instance.plugin_name().to_owned();
    let id = instance.id;

    tokio::spawn(async move {
        tracing::debug!(plugin = %plugin, instance = id, period_ms = period.as_millis() as u64, "tick timer started");
        let mut period = period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(instance) = weak.upgrade() else {
                break;
            };
            if instance.is_faulted() {
                break;
            }
            let outcome = instance
                .run(false, |machine, bridge| {
                    machine.on_tick(bridge).map(|()| machine.tick_period())
                })
                .await
                .and_then(|r| r);
            match outcome {
                Ok(Some(next)) if next != period => {
                    tracing::debug!(plugin = %plugin, instance = id, period_ms = next.as_millis() as u64, "tick period changed");
                    period = next;
                    ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(plugin = %plugin, instance = id, error = %e, "tick callback failed");
                    if e.faults_instance() {
                        instance.mark_faulted();
                    }
                    break;
                }
            }
        }
        tracing::debug!(plugin = %plugin, instance = id, "tick timer stopped");
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use url::Url;

    use super::*;
    use crate::machine::{Action, Exchange};
    use crate::module::{Module, ModuleSource, ModuleStore};
    use crate::transport::{CallFailure, CallFailureKind, CallOutcome, HttpCallRequest};

    struct NoTransport;

    #[async_trait]
    impl HttpTransport for NoTransport {
        async fn send(&self, _upstream: &Url, _request: HttpCallRequest) -> CallOutcome {
            Err(CallFailure::new(CallFailureKind::Other, "no transport in tests"))
        }
    }

    /// Machine whose start sleeps briefly and optionally fails.
    struct StubMachine {
        fail_start: bool,
    }

    impl PluginMachine for StubMachine {
        fn start(&mut self, _bridge: &CapabilityBridge) -> Result<()> {
            std::thread::sleep(Duration::from_millis(20));
            if self.fail_start {
                return Err(HostError::Init {
                    plugin: "stub".into(),
                    reason: "configuration rejected".into(),
                });
            }
            Ok(())
        }

        fn on_request(&mut self, _bridge: &CapabilityBridge, _exchange: &mut Exchange) -> Result<Action> {
            Ok(Action::Continue)
        }

        fn on_http_call_response(
            &mut self,
            _bridge: &CapabilityBridge,
            _exchange: &mut Exchange,
            _token: u32,
            _outcome: &CallOutcome,
        ) -> Result<Action> {
            Ok(Action::Continue)
        }
    }

    fn module() -> Module {
        ModuleStore::with_defaults()
            .unwrap()
            .load(ModuleSource::bytes(
                "empty",
                vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00],
            ))
            .unwrap()
    }

    fn descriptor(name: &str, sharing: Sharing, fail_start: bool) -> Arc<PluginDescriptor> {
        Arc::new(
            PluginDescriptor::builder()
                .with_name(name)
                .with_module(module())
                .with_sharing(sharing)
                .with_machine_factory(move |_| {
                    Ok(Box::new(StubMachine { fail_start }) as Box<dyn PluginMachine>)
                })
                .build()
                .unwrap(),
        )
    }

    /// Machine that asks for a 10ms tick until it has ticked `stop_after`
    /// times.
    struct TickingMachine {
        ticks: Arc<AtomicUsize>,
        stop_after: usize,
        fault: bool,
    }

    impl PluginMachine for TickingMachine {
        fn start(&mut self, _bridge: &CapabilityBridge) -> Result<()> {
            Ok(())
        }

        fn on_request(&mut self, _bridge: &CapabilityBridge, _exchange: &mut Exchange) -> Result<Action> {
            Ok(Action::Continue)
        }

        fn on_http_call_response(
            &mut self,
            _bridge: &CapabilityBridge,
            _exchange: &mut Exchange,
            _token: u32,
            _outcome: &CallOutcome,
        ) -> Result<Action> {
            Ok(Action::Continue)
        }

        fn tick_period(&self) -> Option<Duration> {
            (self.ticks.load(Ordering::SeqCst) < self.stop_after).then_some(Duration::from_millis(10))
        }

        fn on_tick(&mut self, _bridge: &CapabilityBridge) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fault {
                return Err(HostError::PluginFault {
                    plugin: "ticking".into(),
                    reason: "tick trapped".into(),
                });
            }
            Ok(())
        }
    }

    fn ticking(
        name: &str,
        sharing: Sharing,
        ticks: &Arc<AtomicUsize>,
        stop_after: usize,
        fault: bool,
    ) -> Arc<PluginDescriptor> {
        let ticks = Arc::clone(ticks);
        Arc::new(
            PluginDescriptor::builder()
                .with_name(name)
                .with_module(module())
                .with_sharing(sharing)
                .with_machine_factory(move |_| {
                    Ok(Box::new(TickingMachine {
                        ticks: Arc::clone(&ticks),
                        stop_after,
                        fault,
                    }) as Box<dyn PluginMachine>)
                })
                .build()
                .unwrap(),
        )
    }

    fn pool(config: SandboxConfig) -> InstancePool {
        InstancePool::new(config, Arc::new(NoTransport))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_acquire_is_single_flight() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("headerTests", Sharing::Shared, false);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                let d = Arc::clone(&d);
                tokio::spawn(async move { pool.acquire(&d).await })
            })
            .collect();

        let mut leases = Vec::new();
        for h in handles {
            leases.push(h.await.unwrap().unwrap());
        }
        let first = leases[0].id();
        assert!(leases.iter().all(|l| l.id() == first));
        assert_eq!(pool.init_count("headerTests"), 1);
        assert_eq!(pool.shared_instance("headerTests").unwrap().ref_count, 16);

        drop(leases);
        let info = pool.shared_instance("headerTests").unwrap();
        assert_eq!(info.ref_count, 0);
        assert_eq!(info.id, first);
        assert_eq!(pool.live_instances(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_init_failure_reaches_every_waiter_and_is_not_cached() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("broken", Sharing::Shared, true);

        let results = futures::future::join_all((0..8).map(|_| pool.acquire(&d))).await;
        for r in &results {
            match r {
                Err(HostError::Init { plugin, reason }) => {
                    assert_eq!(plugin, "broken");
                    assert_eq!(reason, "configuration rejected");
                }
                other => panic!("expected Init error, got: {other:?}"),
            }
        }
        assert_eq!(pool.init_count("broken"), 1);
        assert!(pool.shared_instance("broken").is_none());

        // The failure was not cached; the next acquire retries.
        assert!(pool.acquire(&d).await.is_err());
        assert_eq!(pool.init_count("broken"), 2);
        assert_eq!(pool.live_instances(), 0);
    }

    #[tokio::test]
    async fn per_request_instances_are_distinct_and_torn_down() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("perRequest", Sharing::PerRequest, false);

        let a = pool.acquire(&d).await.unwrap();
        let b = pool.acquire(&d).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.live_instances(), 2);
        assert_eq!(pool.init_count("perRequest"), 2);

        pool.release(a);
        drop(b);
        assert_eq!(pool.live_instances(), 0);
        assert!(pool.shared_instance("perRequest").is_none());
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_acquires_by_name() {
        let pool = pool(SandboxConfig::default());
        pool.register(descriptor("a", Sharing::Shared, false)).unwrap();
        assert!(matches!(
            pool.register(descriptor("a", Sharing::PerRequest, false)),
            Err(HostError::Config(_))
        ));
        pool.register(descriptor("b", Sharing::PerRequest, false)).unwrap();
        assert_eq!(pool.plugin_names(), vec!["a", "b"]);

        let lease = pool.acquire_by_name("a").await.unwrap();
        assert_eq!(lease.plugin_name(), "a");
        assert!(matches!(
            pool.acquire_by_name("missing").await,
            Err(HostError::NotFound {
                kind: CapabilityKind::Plugin,
                ..
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callbacks_on_one_instance_are_serialized() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("serial", Sharing::Shared, false);
        let active = Arc::new(AtomicU32::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let calls = (0..6).map(|_| {
            let pool = pool.clone();
            let d = Arc::clone(&d);
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            async move {
                let lease = pool.acquire(&d).await.unwrap();
                lease
                    .call(move |_, _| {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_millis(5));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }
        });
        futures::future::join_all(calls).await;
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_callback_is_a_plugin_fault() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("panics", Sharing::Shared, false);
        let lease = pool.acquire(&d).await.unwrap();
        let result: Result<()> = lease.call(|_, _| panic!("boom")).await;
        assert!(matches!(result, Err(HostError::PluginFault { .. })));
    }

    #[tokio::test]
    async fn faulted_shared_instance_is_replaced() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("faulty", Sharing::Shared, false);

        let lease = pool.acquire(&d).await.unwrap();
        let first = lease.id();
        lease.instance().mark_faulted();
        drop(lease);
        assert!(pool.shared_instance("faulty").is_none());

        let lease = pool.acquire(&d).await.unwrap();
        assert_ne!(lease.id(), first);
        assert_eq!(pool.init_count("faulty"), 2);
    }

    #[tokio::test]
    async fn faulted_resident_instance_is_not_handed_out() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("faultyResident", Sharing::Shared, false);

        let a = pool.acquire(&d).await.unwrap();
        a.instance().mark_faulted();

        let b = pool.acquire(&d).await.unwrap();
        assert_ne!(b.id(), a.id());
        assert_eq!(pool.init_count("faultyResident"), 2);

        // Releasing the faulted lease leaves the replacement resident.
        drop(a);
        let info = pool.shared_instance("faultyResident").unwrap();
        assert_eq!(info.id, b.id());
        assert_eq!(info.ref_count, 1);
        assert_eq!(pool.live_instances(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_waiter_does_not_disturb_shared_init() {
        let pool = pool(SandboxConfig::default());
        let d = descriptor("cancelled", Sharing::Shared, false);

        // Start takes 20ms; the first waiter gives up long before that.
        let gave_up = tokio::time::timeout(Duration::from_millis(5), pool.acquire(&d)).await;
        assert!(gave_up.is_err());

        let aborted = {
            let pool = pool.clone();
            let d = Arc::clone(&d);
            tokio::spawn(async move { pool.acquire(&d).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        aborted.abort();
        let _ = aborted.await;

        let leases = futures::future::try_join_all((0..3).map(|_| pool.acquire(&d)))
            .await
            .unwrap();
        assert!(leases.iter().all(|l| l.id() == leases[0].id()));
        assert_eq!(pool.init_count("cancelled"), 1);
        assert_eq!(pool.shared_instance("cancelled").unwrap().ref_count, 3);
        assert_eq!(pool.live_instances(), 1);
    }

    #[tokio::test]
    async fn shared_instance_ticks_without_counting_as_activity() {
        let pool = pool(SandboxConfig::default().with_idle_eviction_ms(40));
        let ticks = Arc::new(AtomicUsize::new(0));
        let d = ticking("ticker", Sharing::Shared, &ticks, usize::MAX, false);

        drop(pool.acquire(&d).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        assert_eq!(pool.evict_idle(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.live_instances(), 0);

        let after_eviction = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_eviction);
    }

    #[tokio::test]
    async fn tick_timer_stops_when_period_is_cleared() {
        let pool = pool(SandboxConfig::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let d = ticking("threeTicks", Sharing::Shared, &ticks, 3, false);

        let _lease = pool.acquire(&d).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn faulting_tick_retires_the_instance() {
        let pool = pool(SandboxConfig::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let d = ticking("badTick", Sharing::Shared, &ticks, usize::MAX, true);

        let first = pool.acquire(&d).await.unwrap().id();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        let lease = pool.acquire(&d).await.unwrap();
        assert_ne!(lease.id(), first);
        assert_eq!(pool.init_count("badTick"), 2);
    }

    #[tokio::test]
    async fn per_request_instances_do_not_tick() {
        let pool = pool(SandboxConfig::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let d = ticking("perRequestTicker", Sharing::PerRequest, &ticks, usize::MAX, false);

        let _lease = pool.acquire(&d).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn evict_idle_respects_references_and_threshold() {
        let pool = pool(SandboxConfig::default().with_idle_eviction_ms(30));
        let d = descriptor("idle", Sharing::Shared, false);

        let lease = pool.acquire(&d).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.evict_idle(), 0, "leased instances are never evicted");

        drop(lease);
        assert_eq!(pool.evict_idle(), 0, "just released, not idle yet");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert!(pool.shared_instance("idle").is_none());
        assert_eq!(pool.live_instances(), 0);
    }

    #[tokio::test]
    async fn evictor_is_disabled_by_default() {
        let pool = pool(SandboxConfig::default());
        assert!(pool.start_evictor().is_none());
        assert_eq!(pool.evict_idle(), 0);
    }

    #[tokio::test]
    async fn background_evictor_sweeps() {
        let pool = pool(SandboxConfig::default().with_idle_eviction_ms(20));
        let d = descriptor("swept", Sharing::Shared, false);
        drop(pool.acquire(&d).await.unwrap());

        let handle = pool.start_evictor().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.shared_instance("swept").is_none());
        handle.abort();
    }
}
