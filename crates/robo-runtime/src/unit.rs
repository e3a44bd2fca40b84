//! # Units
//!
//! A unit is an addressable actor: a string id unique within its system, a typed
//! inbound message, a configuration, a lifecycle state and optional attributes.
//!
//! Application code implements [`Unit`] for its type and hands an instance to the
//! [`Builder`](crate::Builder). The runtime wraps it in a [`UnitHandle`] and owns it
//! from then on. Nothing outside the runtime calls the hooks directly: lifecycle hooks
//! are invoked by the [`System`](crate::System) state machine and
//! [`Unit::on_message`] only by message dispatch.
//!
//! Hooks take `&self`. Units with [`ThreadingPolicy::Normal`] may see several messages
//! at once, so mutable state lives behind atomics or locks.
//!
//! ```rust
//! use std::sync::atomic::{AtomicI64, Ordering};
//! use robo_runtime::{AttributeDescriptor, AttributeKey, AttributeValue, Unit, UnitContext, UnitError};
//!
//! #[derive(Default)]
//! struct Tally {
//!     total: AtomicI64,
//! }
//!
//! impl Tally {
//!     const TOTAL: AttributeDescriptor<i64> = AttributeDescriptor::new("total");
//! }
//!
//! impl Unit for Tally {
//!     type Message = i64;
//!
//!     fn on_message(&self, _ctx: &UnitContext<'_>, amount: i64) -> Result<(), UnitError> {
//!         self.total.fetch_add(amount, Ordering::SeqCst);
//!         Ok(())
//!     }
//!
//!     fn known_attributes(&self) -> Vec<AttributeKey> {
//!         vec![Self::TOTAL.key()]
//!     }
//!
//!     fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
//!         key.matches(&Self::TOTAL)
//!             .then(|| Self::TOTAL.value(self.total.load(Ordering::SeqCst)))
//!     }
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::attribute::{AttributeKey, AttributeValue};
use crate::configuration::Configuration;
use crate::context::ContextExt;
use crate::error::{ConfigurationError, UnitError};
use crate::lifecycle::{AtomicLifecycleState, LifecycleState};
use crate::reference::{AnyReference, DeliveryPolicy, Reference, ThreadingPolicy};
use crate::scheduler::Scheduler;
use crate::system::{System, SystemInner};

/// The behavior of a unit.
///
/// The associated constants are the static markers the runtime reads once, when the
/// unit's reference is created, to decide where its messages run.
pub trait Unit: Send + Sync + 'static {
    /// Inbound message type.
    type Message: Send + 'static;

    /// Which pool dispatches this unit's messages.
    const DELIVERY: DeliveryPolicy = DeliveryPolicy::System;

    /// Whether this unit's messages are serialized.
    const THREADING: ThreadingPolicy = ThreadingPolicy::Normal;

    /// Validates and applies configuration. Return
    /// [`ConfigurationError::MissingKey`] for absent required keys.
    fn on_initialization(
        &self,
        _ctx: &UnitContext<'_>,
        _config: &Configuration,
    ) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Called while the system starts. Must not block indefinitely.
    fn start(&self, _ctx: &UnitContext<'_>) {}

    /// Called while the system stops. Must not block indefinitely.
    fn stop(&self, _ctx: &UnitContext<'_>) {}

    /// Called on the general scheduler while the system shuts down.
    fn shutdown(&self, _ctx: &UnitContext<'_>) {}

    /// Handles one message. Errors and panics are contained by the runtime.
    fn on_message(&self, _ctx: &UnitContext<'_>, _message: Self::Message) -> Result<(), UnitError> {
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        Vec::new()
    }

    fn on_get_attribute(&self, _key: &AttributeKey) -> Option<AttributeValue> {
        None
    }

    /// Reads every known attribute. The default asks
    /// [`on_get_attribute`](Self::on_get_attribute) for each key in turn.
    fn on_get_attributes(&self) -> HashMap<AttributeKey, AttributeValue> {
        self.known_attributes()
            .into_iter()
            .filter_map(|key| self.on_get_attribute(&key).map(|value| (key, value)))
            .collect()
    }
}

/// Message type tag of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    type_id: TypeId,
    name: &'static str,
}

impl MessageType {
    pub fn of<M: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn is<M: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Runtime bookkeeping shared by every unit, independent of its behavior.
pub(crate) struct UnitCore {
    pub(crate) id: String,
    pub(crate) message_type: MessageType,
    pub(crate) delivery: DeliveryPolicy,
    pub(crate) threading: ThreadingPolicy,
    pub(crate) state: AtomicLifecycleState,
    configuration: RwLock<Configuration>,
    system: OnceLock<Weak<SystemInner>>,
}

impl UnitCore {
    fn new<U: Unit>(id: String) -> Self {
        Self {
            id,
            message_type: MessageType::of::<U::Message>(),
            delivery: U::DELIVERY,
            threading: U::THREADING,
            state: AtomicLifecycleState::default(),
            configuration: RwLock::new(Configuration::empty()),
            system: OnceLock::new(),
        }
    }

    pub(crate) fn configuration(&self) -> Configuration {
        self.configuration.read().clone()
    }

    fn system(&self) -> Option<System> {
        self.system.get().and_then(Weak::upgrade).map(System::from_inner)
    }
}

/// What a unit sees of the runtime from inside its hooks.
#[derive(Clone, Copy)]
pub struct UnitContext<'a> {
    core: &'a UnitCore,
}

impl<'a> UnitContext<'a> {
    pub fn id(&self) -> &'a str {
        &self.core.id
    }

    pub fn state(&self) -> LifecycleState {
        self.core.state.load()
    }

    pub fn configuration(&self) -> Configuration {
        self.core.configuration()
    }

    /// The owning system, once the unit has been added to one.
    pub fn system(&self) -> Option<System> {
        self.core.system()
    }

    /// Typed reference to another unit of the same system.
    pub fn reference<M: Send + 'static>(&self, id: &str) -> Option<Reference<M>> {
        self.system()?.reference(id)
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.system().map(|system| system.scheduler())
    }

    pub fn self_reference(&self) -> Option<AnyReference> {
        self.system()?.get_reference(&self.core.id)
    }
}

impl fmt::Debug for UnitContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Object-safe view of a [`UnitCell`], used by the system and by references.
pub(crate) trait ErasedUnit: Send + Sync {
    fn core(&self) -> &UnitCore;
    fn initialize(&self, config: Configuration) -> Result<(), ConfigurationError>;
    fn start(&self);
    fn stop(&self);
    fn shutdown(&self);
    fn deliver(&self, message: Box<dyn Any + Send>) -> Result<(), UnitError>;
    fn known_attributes(&self) -> Vec<AttributeKey>;
    fn get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue>;
    fn get_attributes(&self) -> HashMap<AttributeKey, AttributeValue>;
}

/// Pairs a unit's behavior with its runtime bookkeeping.
pub(crate) struct UnitCell<U> {
    core: UnitCore,
    unit: U,
}

impl<U: Unit> UnitCell<U> {
    fn context(&self) -> UnitContext<'_> {
        UnitContext { core: &self.core }
    }
}

impl<U: Unit> ErasedUnit for UnitCell<U> {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    fn initialize(&self, config: Configuration) -> Result<(), ConfigurationError> {
        *self.core.configuration.write() = config.clone();
        self.unit.on_initialization(&self.context(), &config)?;
        self.core.state.store(LifecycleState::Initialized);
        debug!(unit = %self.core.id, "Unit initialized");
        Ok(())
    }

    fn start(&self) {
        self.unit.start(&self.context());
    }

    fn stop(&self) {
        self.unit.stop(&self.context());
    }

    fn shutdown(&self) {
        self.unit.shutdown(&self.context());
    }

    fn deliver(&self, message: Box<dyn Any + Send>) -> Result<(), UnitError> {
        let message = message.downcast::<U::Message>().map_err(|_| {
            format!(
                "unit {} expects messages of type {}",
                self.core.id, self.core.message_type
            )
        })?;
        self.unit.on_message(&self.context(), *message)
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        self.unit.known_attributes()
    }

    fn get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        self.unit.on_get_attribute(key)
    }

    fn get_attributes(&self) -> HashMap<AttributeKey, AttributeValue> {
        self.unit.on_get_attributes()
    }
}

/// An owned, type-erased unit. Equal to another handle when the ids are equal.
#[derive(Clone)]
pub struct UnitHandle {
    cell: Arc<dyn ErasedUnit>,
}

impl UnitHandle {
    pub fn new<U: Unit>(id: impl Into<String>, unit: U) -> Self {
        Self {
            cell: Arc::new(UnitCell {
                core: UnitCore::new::<U>(id.into()),
                unit,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.cell.core().id
    }

    pub fn state(&self) -> LifecycleState {
        self.cell.core().state.load()
    }

    pub fn message_type(&self) -> MessageType {
        self.cell.core().message_type
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        self.cell.core().delivery
    }

    pub fn threading_policy(&self) -> ThreadingPolicy {
        self.cell.core().threading
    }

    pub fn configuration(&self) -> Configuration {
        self.cell.core().configuration()
    }

    /// Stores `config`, runs [`Unit::on_initialization`] and moves to INITIALIZED.
    /// On error the unit stays in its previous state.
    pub fn initialize(&self, config: Configuration) -> Result<(), ConfigurationError> {
        self.cell.initialize(config)
    }

    pub(crate) fn erased(&self) -> &Arc<dyn ErasedUnit> {
        &self.cell
    }

    pub(crate) fn set_state(&self, state: LifecycleState) {
        self.cell.core().state.store(state);
    }

    /// Attaches the unit to its owning system. The first binding wins.
    pub(crate) fn bind(&self, system: Weak<SystemInner>) {
        let _ = self.cell.core().system.set(system);
    }

    pub(crate) fn same_unit(&self, other: &UnitHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl PartialEq for UnitHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for UnitHandle {}

impl std::hash::Hash for UnitHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("message_type", &self.message_type().name())
            .finish()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
