//! # System
//!
//! The concrete [`Context`]: owns the unit registry, the reference cache, the three
//! execution pools and the global lifecycle state.
//!
//! ## Lifecycle
//!
//! | Operation | From | Effect |
//! |-----------|------|--------|
//! | `start` | INITIALIZED, STOPPED | each unit STARTING, `start()`, STARTED, in registration order; then STARTED |
//! | `start` | STARTED | units untouched |
//! | `stop` | any but SHUTTING_DOWN/SHUTDOWN | emitter cancelled, relay stopped; `stop()` on every unit if the system was STARTED; then STOPPED |
//! | `shutdown` | any but SHUTTING_DOWN/SHUTDOWN | `stop`; SHUTTING_DOWN; work and blocking pools closed; each unit's `shutdown()` on the scheduler; scheduler drained with a bounded wait; SHUTDOWN |
//!
//! Every `start` also (re)starts the optional relay and emitter; their failures are
//! logged and never abort the unit sequence. Lifecycle operations are serialized.
//!
//! ## Configuration keys
//!
//! See [`keys`]. Pool sizes default to small constants.
//!
//! ```rust
//! use robo_runtime::{Configuration, System, SystemError};
//!
//! # fn main() -> Result<(), SystemError> {
//! let config = Configuration::builder()
//!     .add_integer(robo_runtime::system::keys::WORKER_POOL_SIZE, 4)
//!     .build();
//! let system = System::new("demo", &config)?;
//! assert_eq!(system.to_string(), "System id: demo unit count: 0");
//! system.shutdown();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborator::{ContextEmitter, MessageRelay};
use crate::configuration::Configuration;
use crate::context::Context;
use crate::error::SystemError;
use crate::lifecycle::{AtomicLifecycleState, LifecycleState};
use crate::reference::AnyReference;
use crate::scheduler::{PoolSizes, Pools, ScheduledTask, Scheduler};
use crate::unit::{panic_message, UnitHandle};

/// Configuration keys read by [`System::new`].
pub mod keys {
    pub const SCHEDULER_POOL_SIZE: &str = "scheduler_pool_size";
    pub const WORKER_POOL_SIZE: &str = "worker_pool_size";
    pub const BLOCKING_POOL_SIZE: &str = "blocking_pool_size";
    pub const SHUTDOWN_TIMEOUT_MS: &str = "shutdown_timeout_ms";
    /// Child section handed to the message relay.
    pub const MESSAGE_SERVER: &str = "message_server";
    /// Child section for the emitter: `enabled`, `heartbeat_interval_ms`.
    pub const EMITTER: &str = "emitter";
    pub const ENABLED: &str = "enabled";
    pub const HEARTBEAT_INTERVAL_MS: &str = "heartbeat_interval_ms";
}

pub const DEFAULT_SCHEDULER_POOL_SIZE: usize = 2;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 2;
pub const DEFAULT_BLOCKING_POOL_SIZE: usize = 4;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(4000);

#[derive(Default)]
struct Registry {
    units: Vec<UnitHandle>,
    index: HashMap<String, usize>,
}

pub(crate) struct SystemInner {
    uid: String,
    configuration: Configuration,
    state: Arc<AtomicLifecycleState>,
    registry: RwLock<Registry>,
    references: DashMap<String, AnyReference>,
    pools: Arc<Pools>,
    shutdown_timeout: Duration,
    relay: RwLock<Option<Arc<dyn MessageRelay>>>,
    emitter: RwLock<Option<Arc<dyn ContextEmitter>>>,
    emitter_task: Mutex<Option<ScheduledTask>>,
    lifecycle: ReentrantMutex<()>,
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        // References may outlive the system; they must stop queueing.
        self.state.store(LifecycleState::Shutdown);
        self.pools.release();
    }
}

/// The unit runtime. Cheap to clone; clones share the same system.
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

fn pool_size(config: &Configuration, key: &str, default: usize) -> usize {
    usize::try_from(config.get_integer(key, default as i64))
        .unwrap_or(default)
        .max(1)
}

/// Runs a unit hook, containing any panic it raises.
fn contain(unit: &UnitHandle, hook: &'static str, run: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(run)) {
        error!(
            unit = %unit.id(),
            state = %unit.state(),
            hook,
            panic = panic_message(&*panic),
            "Unit hook panicked"
        );
    }
}

impl System {
    /// Creates an UNINITIALIZED system and its pools.
    pub fn new(uid: impl Into<String>, config: &Configuration) -> Result<Self, SystemError> {
        let uid = uid.into();
        let sizes = PoolSizes {
            scheduler: pool_size(config, keys::SCHEDULER_POOL_SIZE, DEFAULT_SCHEDULER_POOL_SIZE),
            work: pool_size(config, keys::WORKER_POOL_SIZE, DEFAULT_WORKER_POOL_SIZE),
            blocking: pool_size(config, keys::BLOCKING_POOL_SIZE, DEFAULT_BLOCKING_POOL_SIZE),
        };
        let shutdown_timeout = u64::try_from(config.get_integer(
            keys::SHUTDOWN_TIMEOUT_MS,
            DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as i64,
        ))
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        let pools = Pools::new(sizes)?;
        debug!(system = %uid, ?sizes, ?shutdown_timeout, "System created");

        Ok(Self {
            inner: Arc::new(SystemInner {
                uid,
                configuration: config.clone(),
                state: Arc::new(AtomicLifecycleState::default()),
                registry: RwLock::new(Registry::default()),
                references: DashMap::new(),
                pools: Arc::new(pools),
                shutdown_timeout,
                relay: RwLock::new(None),
                emitter: RwLock::new(None),
                emitter_task: Mutex::new(None),
                lifecycle: ReentrantMutex::new(()),
            }),
        })
    }

    /// A system with a random id and default configuration.
    pub fn with_defaults() -> Result<Self, SystemError> {
        Self::new(Uuid::new_v4().to_string(), &Configuration::empty())
    }

    pub(crate) fn from_inner(inner: Arc<SystemInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SystemInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.uid
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.load()
    }

    pub fn configuration(&self) -> Configuration {
        self.inner.configuration.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.inner.pools.scheduler.clone()
    }

    pub fn unit_count(&self) -> usize {
        self.inner.registry.read().units.len()
    }

    /// Registers `units`. Only valid while the system is UNINITIALIZED; the whole
    /// batch is rejected if any id is already taken.
    pub fn add_units(&self, units: impl IntoIterator<Item = UnitHandle>) -> Result<(), SystemError> {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if state != LifecycleState::Uninitialized {
            return Err(SystemError::Frozen { state });
        }

        let units: Vec<UnitHandle> = units.into_iter().collect();
        let mut registry = self.inner.registry.write();
        let mut batch = HashSet::new();
        for unit in &units {
            if registry.index.contains_key(unit.id()) || !batch.insert(unit.id()) {
                return Err(SystemError::DuplicateId {
                    id: unit.id().to_owned(),
                });
            }
        }

        for unit in units {
            unit.bind(self.downgrade());
            debug!(system = %self.inner.uid, unit = %unit.id(), "Unit registered");
            let position = registry.units.len();
            registry.index.insert(unit.id().to_owned(), position);
            registry.units.push(unit);
        }
        Ok(())
    }

    /// Moves the system to `state` unconditionally. Used by the builder to freeze
    /// the registry.
    pub fn set_state(&self, state: LifecycleState) {
        self.inner.state.store(state);
    }

    pub fn set_relay(&self, relay: Option<Arc<dyn MessageRelay>>) {
        *self.inner.relay.write() = relay;
    }

    pub fn set_emitter(&self, emitter: Option<Arc<dyn ContextEmitter>>) {
        *self.inner.emitter.write() = emitter;
    }

    fn units(&self) -> Vec<UnitHandle> {
        self.inner.registry.read().units.clone()
    }

    pub fn get_unit(&self, id: &str) -> Option<UnitHandle> {
        let registry = self.inner.registry.read();
        registry.index.get(id).map(|&i| registry.units[i].clone())
    }

    /// The cached reference for `unit`, created on first access.
    ///
    /// A unit that is not registered here gets a fresh, uncached reference.
    pub fn reference_for(&self, unit: &UnitHandle) -> AnyReference {
        let registered = self
            .get_unit(unit.id())
            .is_some_and(|known| known.same_unit(unit));
        if !registered {
            return self.new_reference(unit);
        }
        if let Some(reference) = self.inner.references.get(unit.id()) {
            return reference.value().clone();
        }
        self.inner
            .references
            .entry(unit.id().to_owned())
            .or_insert_with(|| self.new_reference(unit))
            .value()
            .clone()
    }

    fn new_reference(&self, unit: &UnitHandle) -> AnyReference {
        AnyReference::new(unit, self.inner.state.clone(), self.inner.pools.clone())
    }

    pub fn get_reference(&self, id: &str) -> Option<AnyReference> {
        self.get_unit(id).map(|unit| self.reference_for(&unit))
    }

    pub fn get_units(&self) -> Vec<AnyReference> {
        self.units()
            .iter()
            .map(|unit| self.reference_for(unit))
            .collect()
    }

    pub fn start(&self) -> Result<(), SystemError> {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if state.is_terminating() || state == LifecycleState::Uninitialized {
            warn!(system = %self.inner.uid, %state, "Cannot start system");
            return Err(SystemError::InvalidTransition {
                state,
                operation: "start",
            });
        }

        let from_initialized = self
            .inner
            .state
            .compare_and_set(LifecycleState::Initialized, LifecycleState::Starting);
        if from_initialized
            || self
                .inner
                .state
                .compare_and_set(LifecycleState::Stopped, LifecycleState::Starting)
        {
            info!(system = %self.inner.uid, "Starting system");
            for unit in self.units() {
                unit.set_state(LifecycleState::Starting);
                debug!(unit = %unit.id(), "Starting unit");
                contain(&unit, "start", || unit.erased().start());
                unit.set_state(LifecycleState::Started);
            }
            self.inner.state.store(LifecycleState::Started);
            info!(system = %self.inner.uid, units = self.unit_count(), "System started");
        }

        self.start_collaborators();
        Ok(())
    }

    fn start_collaborators(&self) {
        let relay = self.inner.relay.read().clone();
        if let Some(relay) = relay {
            let uid = self.inner.uid.clone();
            self.inner.pools.blocking.execute(move || {
                if let Err(e) = relay.start() {
                    error!(system = %uid, error = %e, "Could not start message relay, proceeding without");
                }
            });
        }

        let Some(emitter) = self.inner.emitter.read().clone() else {
            return;
        };
        let settings = self
            .inner
            .configuration
            .get_child(keys::EMITTER)
            .unwrap_or_default();
        if !settings.get_boolean(keys::ENABLED, true) {
            debug!(system = %self.inner.uid, "Emitter disabled");
            return;
        }
        let interval = u64::try_from(settings.get_integer(keys::HEARTBEAT_INTERVAL_MS, -1))
            .map(Duration::from_millis)
            .unwrap_or_else(|_| emitter.heartbeat_interval());

        let task = self.inner.pools.scheduler.schedule_at_fixed_rate(
            move || emitter.emit(),
            Duration::ZERO,
            interval,
        );
        if let Some(previous) = self.inner.emitter_task.lock().replace(task) {
            previous.cancel();
        }
        debug!(system = %self.inner.uid, ?interval, "Emitter scheduled");
    }

    pub fn stop(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if state.is_terminating() {
            debug!(system = %self.inner.uid, %state, "System already shutting down, stop ignored");
            return;
        }
        self.stop_locked();
    }

    fn stop_locked(&self) {
        if let Some(task) = self.inner.emitter_task.lock().take() {
            task.cancel();
        }
        let relay = self.inner.relay.read().clone();
        if let Some(relay) = relay {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| relay.stop())) {
                error!(system = %self.inner.uid, panic = panic_message(&*panic), "Message relay panicked while stopping");
            }
        }

        if self
            .inner
            .state
            .compare_and_set(LifecycleState::Started, LifecycleState::Stopping)
        {
            info!(system = %self.inner.uid, "Stopping system");
            for unit in self.units() {
                debug!(unit = %unit.id(), "Stopping unit");
                contain(&unit, "stop", || unit.erased().stop());
            }
        }
        self.inner.state.store(LifecycleState::Stopped);
        info!(system = %self.inner.uid, "System stopped");
    }

    /// Stops the system, then shuts every unit and pool down. Blocks until the
    /// pools drain or the shutdown timeout passes. Idempotent.
    pub fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if state.is_terminating() {
            debug!(system = %self.inner.uid, %state, "System already shut down");
            return;
        }

        self.stop_locked();
        info!(system = %self.inner.uid, "Shutting down system");
        self.inner.state.store(LifecycleState::ShuttingDown);
        let units = self.units();
        for unit in &units {
            unit.set_state(LifecycleState::ShuttingDown);
        }

        let deadline = Instant::now() + self.inner.shutdown_timeout;
        let pools = &self.inner.pools;
        pools.work.close();
        pools.blocking.close();

        for unit in units {
            pools.scheduler.execute(move || {
                debug!(unit = %unit.id(), "Shutting down unit");
                contain(&unit, "shutdown", || unit.erased().shutdown());
                unit.set_state(LifecycleState::Shutdown);
            });
        }

        if !pools.scheduler.shutdown_until(deadline) {
            warn!(
                system = %self.inner.uid,
                timeout_ms = self.inner.shutdown_timeout.as_millis() as u64,
                "Scheduler did not terminate in time"
            );
        }
        for pool in [&pools.work, &pools.blocking] {
            if !pool.await_termination(deadline) {
                warn!(system = %self.inner.uid, pool = pool.name(), "Pool did not drain in time");
            }
        }
        pools.release();

        self.inner.state.store(LifecycleState::Shutdown);
        info!(system = %self.inner.uid, "System shut down");
    }
}

impl Context for System {
    fn id(&self) -> &str {
        System::id(self)
    }

    fn state(&self) -> LifecycleState {
        System::state(self)
    }

    fn configuration(&self) -> Configuration {
        System::configuration(self)
    }

    fn start(&self) -> Result<(), SystemError> {
        System::start(self)
    }

    fn stop(&self) {
        System::stop(self)
    }

    fn shutdown(&self) {
        System::shutdown(self)
    }

    fn scheduler(&self) -> Scheduler {
        System::scheduler(self)
    }

    fn get_reference(&self, id: &str) -> Option<AnyReference> {
        System::get_reference(self, id)
    }

    fn get_units(&self) -> Vec<AnyReference> {
        System::get_units(self)
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "System id: {} unit count: {}",
            self.inner.uid,
            self.unit_count()
        )
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("id", &self.inner.uid)
            .field("state", &self.state())
            .field("units", &self.unit_count())
            .finish()
    }
}
