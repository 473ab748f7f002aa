//! Browser instance lifecycle.
//!
//! [`BrowserLifecycleManager`] owns the single active browser instance,
//! leases tabs from it and replaces it when it crashes, hangs, has served
//! `max_iterations_per_instance` renders or has outlived the forced restart
//! period.
//!
//! State machine: `Spawning -> Ready <-> Busy -> Restarting -> Spawning`, with
//! `Dead` reachable from anywhere on a crash and always followed by
//! `Spawning`. The slot is guarded by a `std::sync::RwLock` held only in short
//! synchronous sections; respawns are serialized by an async mutex and the
//! current generation is published over a `watch` channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use rendr_core::{AppConfig, Error};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::driver::{BrowserDriver, BrowserHandle, DriverError, TabOptions};
use crate::ledger::RequestLedger;
use crate::tab::Tab;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one browser instance. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Spawning,
    Ready,
    Busy,
    Restarting,
    Dead,
}

/// Recycling and acquisition limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub max_iterations: u32,
    pub force_restart_period: Option<Duration>,
    pub acquire_attempts: u32,
    pub acquire_backoff: Duration,
    pub launch_timeout: Duration,
    pub close_timeout: Duration,
}

impl LifecyclePolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_iterations: config.max_iterations_per_instance.max(1),
            force_restart_period: config.force_restart_period(),
            acquire_attempts: config.acquire_attempts.max(1),
            acquire_backoff: config.acquire_backoff(),
            launch_timeout: config.launch_timeout(),
            close_timeout: config.close_timeout(),
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    Crashed,
    Recycled,
    Shutdown,
}

/// Shared cancellation of every tab bound to one instance.
#[derive(Debug, Clone)]
struct Teardown {
    token: CancellationToken,
    reason: Arc<OnceLock<TeardownReason>>,
}

impl Teardown {
    fn new() -> Self {
        Self { token: CancellationToken::new(), reason: Arc::new(OnceLock::new()) }
    }

    /// First reason wins.
    fn trigger(&self, reason: TeardownReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    fn reason(&self) -> Option<TeardownReason> {
        self.reason.get().copied()
    }
}

struct Instance {
    id: InstanceId,
    handle: Arc<dyn BrowserHandle>,
    iteration_count: u32,
    active_tabs: u32,
    last_restart_at: Instant,
    teardown: Teardown,
}

struct Slot {
    state: InstanceState,
    instance: Option<Instance>,
    respawn_scheduled: bool,
    shutting_down: bool,
    restarts: u64,
}

struct Inner {
    driver: Arc<dyn BrowserDriver>,
    policy: LifecyclePolicy,
    slot: RwLock<Slot>,
    spawn_lock: Mutex<()>,
    generation: watch::Sender<Option<InstanceId>>,
}

/// Snapshot returned by [`BrowserLifecycleManager::status`].
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub driver: String,
    pub state: InstanceState,
    pub instance_id: Option<InstanceId>,
    pub iteration_count: u32,
    pub active_tabs: u32,
    pub restarts: u64,
    pub uptime_ms: Option<u64>,
}

/// Claim on one tab slot of an instance, settled exactly once on drop.
pub struct TabLease {
    instance_id: InstanceId,
    teardown: Teardown,
    generation: watch::Receiver<Option<InstanceId>>,
    manager: Weak<Inner>,
    opened: bool,
}

impl TabLease {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Count this lease as a served render when it settles.
    pub(crate) fn mark_opened(&mut self) {
        self.opened = true;
    }

    pub fn token(&self) -> CancellationToken {
        self.teardown.token.clone()
    }

    fn current(&self) -> Option<InstanceId> {
        *self.generation.borrow()
    }

    pub fn teardown_error(&self) -> Error {
        match self.teardown.reason() {
            Some(TeardownReason::Crashed) | Some(TeardownReason::Shutdown) => Error::BrowserConnectionClosed,
            Some(TeardownReason::Recycled) | None => Error::StaleBrowserGeneration {
                expected: self.instance_id.get(),
                current: self.current().map(InstanceId::get),
            },
        }
    }

    pub fn ensure_current(&self) -> Result<(), Error> {
        if self.teardown.token.is_cancelled() {
            return Err(self.teardown_error());
        }
        match self.current() {
            Some(current) if current == self.instance_id => Ok(()),
            current => Err(Error::StaleBrowserGeneration {
                expected: self.instance_id.get(),
                current: current.map(InstanceId::get),
            }),
        }
    }
}

impl Drop for TabLease {
    fn drop(&mut self) {
        if let Some(inner) = self.manager.upgrade() {
            inner.finish_lease(self.instance_id, self.opened);
        }
    }
}

impl Inner {
    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip a serving instance to `Restarting` once it outlived the forced period.
    fn check_forced_restart(&self, slot: &mut Slot) -> bool {
        let (Some(period), Some(instance)) = (self.policy.force_restart_period, slot.instance.as_ref()) else {
            return false;
        };
        let serving = matches!(slot.state, InstanceState::Ready | InstanceState::Busy);
        if !serving || instance.last_restart_at.elapsed() <= period {
            return false;
        }
        tracing::info!(
            instance_id = %instance.id,
            period_secs = period.as_secs(),
            "Forced restart period elapsed, draining instance"
        );
        slot.state = InstanceState::Restarting;
        true
    }

    fn checkout(self: &Arc<Self>) -> Result<(TabLease, Arc<dyn BrowserHandle>), InstanceState> {
        let mut guard = self.write_slot();
        let slot = &mut *guard;
        if slot.shutting_down {
            return Err(InstanceState::Dead);
        }

        let Some((id, active)) = slot.instance.as_ref().map(|i| (i.id, i.active_tabs)) else {
            let state = slot.state;
            self.schedule_respawn(slot, None);
            return Err(state);
        };

        match slot.state {
            InstanceState::Ready | InstanceState::Busy => {}
            InstanceState::Dead => {
                self.schedule_respawn(slot, Some(id));
                return Err(InstanceState::Dead);
            }
            state => return Err(state),
        }

        if self.check_forced_restart(slot) {
            if active == 0 {
                self.schedule_respawn(slot, Some(id));
            }
            return Err(InstanceState::Restarting);
        }

        let Some(instance) = slot.instance.as_mut() else {
            return Err(slot.state);
        };
        instance.active_tabs += 1;
        let lease = TabLease {
            instance_id: instance.id,
            teardown: instance.teardown.clone(),
            generation: self.generation.subscribe(),
            manager: Arc::downgrade(self),
            opened: false,
        };
        let handle = Arc::clone(&instance.handle);
        slot.state = InstanceState::Busy;
        Ok((lease, handle))
    }

    fn finish_lease(self: &Arc<Self>, id: InstanceId, counted: bool) {
        let mut guard = self.write_slot();
        let slot = &mut *guard;
        let Some(instance) = slot.instance.as_mut().filter(|i| i.id == id) else {
            return;
        };

        instance.active_tabs = instance.active_tabs.saturating_sub(1);
        if counted {
            instance.iteration_count += 1;
        }
        let (active, iterations) = (instance.active_tabs, instance.iteration_count);

        if counted
            && iterations >= self.policy.max_iterations
            && matches!(slot.state, InstanceState::Ready | InstanceState::Busy)
        {
            tracing::info!(instance_id = %id, iterations, "Iteration limit reached, restarting once idle");
            slot.state = InstanceState::Restarting;
        }

        match slot.state {
            InstanceState::Restarting if active == 0 => self.schedule_respawn(slot, Some(id)),
            InstanceState::Busy if active == 0 => slot.state = InstanceState::Ready,
            _ => {}
        }
    }

    /// Schedule at most one respawn at a time.
    fn schedule_respawn(self: &Arc<Self>, slot: &mut Slot, expected: Option<InstanceId>) {
        if slot.respawn_scheduled || slot.shutting_down {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available to respawn the browser");
            return;
        };
        slot.respawn_scheduled = true;
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = inner.respawn(expected).await {
                tracing::warn!("Browser respawn failed: {e}");
            }
        });
    }

    /// Replace `expected` (or an empty slot) with a freshly started instance.
    async fn respawn(self: &Arc<Self>, expected: Option<InstanceId>) -> Result<InstanceId, DriverError> {
        let _spawning = self.spawn_lock.lock().await;

        let old = {
            let mut slot = self.write_slot();
            if slot.shutting_down {
                slot.respawn_scheduled = false;
                return Err(DriverError::ConnectionClosed);
            }
            if let Some(current) = slot.instance.as_ref().map(|i| i.id)
                && Some(current) != expected
                && matches!(slot.state, InstanceState::Ready | InstanceState::Busy)
            {
                slot.respawn_scheduled = false;
                return Ok(current);
            }
            slot.state = InstanceState::Spawning;
            let old = slot.instance.take();
            if old.is_some() {
                slot.restarts += 1;
            }
            old
        };
        self.generation.send_replace(None);

        if let Some(old) = old {
            old.teardown.trigger(TeardownReason::Recycled);
            self.close_instance(old).await;
        }

        let handle = match tokio::time::timeout(self.policy.launch_timeout, self.driver.start()).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.mark_spawn_failed();
                return Err(e);
            }
            Err(_) => {
                self.mark_spawn_failed();
                return Err(DriverError::Launch(format!(
                    "timed out after {}ms",
                    self.policy.launch_timeout.as_millis()
                )));
            }
        };

        let id = InstanceId::next();
        let closed = handle.closed();
        let rejected = {
            let mut slot = self.write_slot();
            slot.respawn_scheduled = false;
            if slot.shutting_down {
                Some(handle)
            } else {
                slot.instance = Some(Instance {
                    id,
                    handle,
                    iteration_count: 0,
                    active_tabs: 0,
                    last_restart_at: Instant::now(),
                    teardown: Teardown::new(),
                });
                slot.state = InstanceState::Ready;
                None
            }
        };
        if let Some(handle) = rejected {
            let _ = tokio::time::timeout(self.policy.close_timeout, handle.close()).await;
            return Err(DriverError::ConnectionClosed);
        }

        self.generation.send_replace(Some(id));
        self.watch_for_crash(id, closed);
        tracing::info!(instance_id = %id, driver = self.driver.name(), "Browser instance ready");
        Ok(id)
    }

    fn mark_spawn_failed(&self) {
        let mut slot = self.write_slot();
        slot.state = InstanceState::Dead;
        slot.respawn_scheduled = false;
    }

    async fn close_instance(&self, instance: Instance) {
        match tokio::time::timeout(self.policy.close_timeout, instance.handle.close()).await {
            Ok(Ok(())) => tracing::debug!(instance_id = %instance.id, "Browser instance closed"),
            Ok(Err(e)) => tracing::warn!(instance_id = %instance.id, "Closing browser instance failed: {e}"),
            Err(_) => tracing::warn!(instance_id = %instance.id, "Browser instance did not close in time, abandoned"),
        }
    }

    fn watch_for_crash(self: &Arc<Self>, id: InstanceId, mut closed: watch::Receiver<bool>) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = closed.wait_for(|closed| *closed).await;
            if let Some(inner) = inner.upgrade() {
                inner.on_instance_crashed(id);
            }
        });
    }

    fn on_instance_crashed(self: &Arc<Self>, id: InstanceId) {
        self.tear_down(id, TeardownReason::Crashed, InstanceState::Dead);
    }

    fn tear_down(self: &Arc<Self>, id: InstanceId, reason: TeardownReason, next: InstanceState) {
        let mut guard = self.write_slot();
        let slot = &mut *guard;
        let Some((teardown, active)) =
            slot.instance.as_ref().filter(|i| i.id == id).map(|i| (i.teardown.clone(), i.active_tabs))
        else {
            return;
        };

        match reason {
            TeardownReason::Crashed => {
                tracing::warn!(instance_id = %id, active_tabs = active, "Browser connection lost, cancelling tabs")
            }
            _ => tracing::warn!(instance_id = %id, active_tabs = active, "Recycling browser instance"),
        }

        teardown.trigger(reason);
        slot.state = next;
        self.generation.send_replace(None);
        self.schedule_respawn(slot, Some(id));
    }

    /// Periodic upkeep. Returns `false` once the manager shut down.
    fn maintain(self: &Arc<Self>) -> bool {
        let mut guard = self.write_slot();
        let slot = &mut *guard;
        if slot.shutting_down {
            return false;
        }

        match slot.instance.as_ref().map(|i| (i.id, i.active_tabs)) {
            None => self.schedule_respawn(slot, None),
            Some((id, active)) => {
                self.check_forced_restart(slot);
                let needs_respawn = match slot.state {
                    InstanceState::Restarting => active == 0,
                    InstanceState::Dead => true,
                    _ => false,
                };
                if needs_respawn {
                    self.schedule_respawn(slot, Some(id));
                }
            }
        }
        true
    }
}

/// Owner of the browser instance. Cheap to clone; clones share the instance.
#[derive(Clone)]
pub struct BrowserLifecycleManager {
    inner: Arc<Inner>,
}

impl BrowserLifecycleManager {
    pub fn new(driver: Arc<dyn BrowserDriver>, policy: LifecyclePolicy) -> Self {
        let (generation, _) = watch::channel(None);
        let slot = Slot {
            state: InstanceState::Spawning,
            instance: None,
            respawn_scheduled: false,
            shutting_down: false,
            restarts: 0,
        };
        Self {
            inner: Arc::new(Inner { driver, policy, slot: RwLock::new(slot), spawn_lock: Mutex::new(()), generation }),
        }
    }

    pub fn from_config(driver: Arc<dyn BrowserDriver>, config: &AppConfig) -> Self {
        Self::new(driver, LifecyclePolicy::from_config(config))
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.inner.policy
    }

    /// Start the first instance. Returns the running instance if one exists.
    pub async fn start(&self) -> Result<InstanceId, Error> {
        self.inner.write_slot().respawn_scheduled = true;
        self.inner.respawn(None).await.map_err(|e| {
            tracing::warn!(driver = self.inner.driver.name(), "Browser start failed: {e}");
            match e {
                DriverError::ConnectionClosed => Error::BrowserConnectionClosed,
                _ => Error::BrowserUnavailable { attempts: 1 },
            }
        })
    }

    /// Lease a tab, retrying with backoff while no instance is serving.
    ///
    /// # Errors
    ///
    /// Returns `Error::BrowserUnavailable` once every attempt failed.
    pub async fn acquire_tab(&self, opts: &TabOptions) -> Result<Tab, Error> {
        let attempts = self.inner.policy.acquire_attempts.max(1);
        for attempt in 1..=attempts {
            match self.inner.checkout() {
                Ok((lease, browser)) => {
                    let instance_id = lease.instance_id();
                    match tokio::time::timeout(self.inner.policy.launch_timeout, browser.open_tab(opts)).await {
                        Ok(Ok((handle, events))) => {
                            let ledger = RequestLedger::new(opts.follow_redirects, opts.log_requests);
                            tracing::debug!(instance_id = %instance_id, tab_id = handle.id(), "Tab opened");
                            return Ok(Tab::new(handle, events, ledger, lease));
                        }
                        Ok(Err(e)) => tracing::warn!(instance_id = %instance_id, attempt, "Opening tab failed: {e}"),
                        Err(_) => tracing::warn!(instance_id = %instance_id, attempt, "Opening tab timed out"),
                    }
                }
                Err(state) => tracing::debug!(?state, attempt, "No browser instance ready"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.inner.policy.acquire_backoff).await;
            }
        }
        Err(Error::BrowserUnavailable { attempts })
    }

    /// Close a tab and settle its lease.
    pub async fn release_tab(&self, mut tab: Tab) {
        match tokio::time::timeout(self.inner.policy.close_timeout, tab.handle().close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(tab_id = tab.id(), "Closing tab failed: {e}"),
            Err(_) => tracing::warn!(tab_id = tab.id(), "Tab did not close in time, abandoned"),
        }
        tab.mark_released();
    }

    /// Mark the instance dead, cancel every bound tab and respawn.
    pub fn on_instance_crashed(&self, id: InstanceId) {
        self.inner.on_instance_crashed(id);
    }

    /// Tear the instance down now, e.g. after a hard timeout. Renders still
    /// bound to it fail with `StaleBrowserGeneration`.
    pub fn recycle(&self, id: InstanceId) {
        self.inner.tear_down(id, TeardownReason::Recycled, InstanceState::Restarting);
    }

    pub fn current_instance(&self) -> Option<InstanceId> {
        *self.inner.generation.borrow()
    }

    /// Subscribe to generation changes; `None` while no instance serves.
    pub fn subscribe(&self) -> watch::Receiver<Option<InstanceId>> {
        self.inner.generation.subscribe()
    }

    pub fn state(&self) -> InstanceState {
        self.inner.read_slot().state
    }

    pub fn status(&self) -> LifecycleStatus {
        let slot = self.inner.read_slot();
        let instance = slot.instance.as_ref();
        LifecycleStatus {
            driver: self.inner.driver.name().to_string(),
            state: slot.state,
            instance_id: instance.map(|i| i.id),
            iteration_count: instance.map_or(0, |i| i.iteration_count),
            active_tabs: instance.map_or(0, |i| i.active_tabs),
            restarts: slot.restarts,
            uptime_ms: instance.map(|i| u64::try_from(i.last_restart_at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Run forced-restart checks and failed-launch recovery every `every`.
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if !inner.maintain() {
                    break;
                }
            }
        })
    }

    /// Close the instance for good. No respawn happens afterwards.
    pub async fn shutdown(&self) {
        let instance = {
            let mut slot = self.inner.write_slot();
            slot.shutting_down = true;
            slot.state = InstanceState::Dead;
            slot.instance.take()
        };
        self.inner.generation.send_replace(None);
        if let Some(instance) = instance {
            instance.teardown.trigger(TeardownReason::Shutdown);
            self.inner.close_instance(instance).await;
        }
        tracing::info!("Browser lifecycle manager shut down");
    }
}
