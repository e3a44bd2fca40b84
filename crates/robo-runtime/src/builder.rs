//! # Builder
//!
//! Assembles a [`System`] from units, then freezes it into INITIALIZED.
//!
//! Units come from three places:
//!
//! 1. **Direct instances**: [`Builder::add`] and [`Builder::add_configured`].
//! 2. **Registered classes**: a [`UnitFactories`] table maps class names to
//!    constructors, and [`Builder::add_class`] instantiates one by name.
//! 3. **Declarations**: [`UnitDeclaration`] records (id, class, configuration)
//!    produced by an external declarative source, consumed by
//!    [`Builder::add_declared`].
//!
//! ```rust
//! use robo_runtime::{Builder, BuilderError, Configuration, Unit};
//!
//! struct Beacon;
//! impl Unit for Beacon {
//!     type Message = ();
//! }
//!
//! # fn main() -> Result<(), BuilderError> {
//! let mut builder = Builder::new()?;
//! builder.register_class("beacon", || Beacon);
//! builder
//!     .add("left", Beacon)?
//!     .add_class("beacon", "right", Some(Configuration::empty()))?;
//! let system = builder.build()?;
//!
//! assert_eq!(system.unit_count(), 2);
//! system.shutdown();
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::collaborator::{ContextEmitter, LookupService, MessageRelay};
use crate::configuration::Configuration;
use crate::error::BuilderError;
use crate::lifecycle::LifecycleState;
use crate::system::System;
use crate::unit::{Unit, UnitHandle};

type Constructor = Arc<dyn Fn(&str) -> UnitHandle + Send + Sync>;

/// Constructors for units, by class name.
#[derive(Clone, Default)]
pub struct UnitFactories {
    constructors: HashMap<String, Constructor>,
}

impl UnitFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<U, F>(&mut self, class: impl Into<String>, constructor: F) -> &mut Self
    where
        U: Unit,
        F: Fn() -> U + Send + Sync + 'static,
    {
        self.constructors.insert(
            class.into(),
            Arc::new(move |id: &str| UnitHandle::new(id, constructor())),
        );
        self
    }

    /// A fresh, uninitialized unit of `class`.
    pub fn create(&self, class: &str, id: &str) -> Option<UnitHandle> {
        self.constructors.get(class).map(|constructor| constructor(id))
    }

    pub fn contains(&self, class: &str) -> bool {
        self.constructors.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl fmt::Debug for UnitFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

/// One unit as described by a declarative source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDeclaration {
    pub id: String,
    pub class: String,
    #[serde(default)]
    pub configuration: Option<Configuration>,
}

pub struct Builder {
    system: System,
    units: Vec<UnitHandle>,
    ids: HashSet<String>,
    factories: UnitFactories,
    lookup: Option<Arc<dyn LookupService>>,
}

impl Builder {
    /// A builder for a system with a random id and default configuration.
    pub fn new() -> Result<Self, BuilderError> {
        Self::with_configuration(Uuid::new_v4().to_string(), &Configuration::empty())
    }

    /// A builder for a system with the given id and configuration. The system and
    /// its pools exist from here on; units are attached to it as they are added.
    pub fn with_configuration(
        uid: impl Into<String>,
        config: &Configuration,
    ) -> Result<Self, BuilderError> {
        Ok(Self {
            system: System::new(uid, config)?,
            units: Vec::new(),
            ids: HashSet::new(),
            factories: UnitFactories::default(),
            lookup: None,
        })
    }

    pub fn with_factories(mut self, factories: UnitFactories) -> Self {
        self.factories = factories;
        self
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn LookupService>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_relay(self, relay: Arc<dyn MessageRelay>) -> Self {
        self.system.set_relay(Some(relay));
        self
    }

    pub fn with_emitter(self, emitter: Arc<dyn ContextEmitter>) -> Self {
        self.system.set_emitter(Some(emitter));
        self
    }

    /// The system under construction.
    pub fn context(&self) -> &System {
        &self.system
    }

    pub fn register_class<U, F>(&mut self, class: impl Into<String>, constructor: F) -> &mut Self
    where
        U: Unit,
        F: Fn() -> U + Send + Sync + 'static,
    {
        self.factories.register(class, constructor);
        self
    }

    /// Adds `unit` under `id`. It is initialized with an empty configuration at
    /// [`build`](Self::build) unless initialized before.
    pub fn add<U: Unit>(&mut self, id: impl Into<String>, unit: U) -> Result<&mut Self, BuilderError> {
        self.add_handle(Some(UnitHandle::new(id, unit)))
    }

    /// Adds `unit` under `id` and initializes it with `config` right away.
    pub fn add_configured<U: Unit>(
        &mut self,
        id: impl Into<String>,
        unit: U,
        config: Configuration,
    ) -> Result<&mut Self, BuilderError> {
        let handle = UnitHandle::new(id, unit);
        self.check_id(handle.id())?;
        self.initialize(&handle, config)?;
        self.add_handle(Some(handle))
    }

    /// Adds an already wrapped unit. `None` is rejected.
    pub fn add_handle(&mut self, unit: Option<UnitHandle>) -> Result<&mut Self, BuilderError> {
        let unit = unit.ok_or(BuilderError::NullUnit)?;
        self.check_id(unit.id())?;
        unit.bind(self.system.downgrade());
        debug!(unit = %unit.id(), message_type = %unit.message_type(), "Unit added");
        self.ids.insert(unit.id().to_owned());
        self.units.push(unit);
        Ok(self)
    }

    pub fn add_all(
        &mut self,
        units: impl IntoIterator<Item = UnitHandle>,
    ) -> Result<&mut Self, BuilderError> {
        for unit in units {
            self.add_handle(Some(unit))?;
        }
        Ok(self)
    }

    /// Instantiates a registered class under `id`, initializing it when a
    /// configuration is given.
    pub fn add_class(
        &mut self,
        class: &str,
        id: &str,
        config: Option<Configuration>,
    ) -> Result<&mut Self, BuilderError> {
        self.check_id(id)?;
        let unit = self
            .factories
            .create(class, id)
            .ok_or_else(|| BuilderError::UnknownClass {
                class: class.to_owned(),
            })?;
        if let Some(config) = config {
            self.initialize(&unit, config)?;
        }
        self.add_handle(Some(unit))
    }

    pub fn add_declared(
        &mut self,
        declarations: impl IntoIterator<Item = UnitDeclaration>,
    ) -> Result<&mut Self, BuilderError> {
        for declaration in declarations {
            self.add_class(&declaration.class, &declaration.id, declaration.configuration)?;
        }
        Ok(self)
    }

    fn check_id(&self, id: &str) -> Result<(), BuilderError> {
        if self.ids.contains(id) {
            return Err(BuilderError::DuplicateId { id: id.to_owned() });
        }
        Ok(())
    }

    fn initialize(&self, unit: &UnitHandle, config: Configuration) -> Result<(), BuilderError> {
        unit.bind(self.system.downgrade());
        unit.initialize(config)
            .map_err(|source| BuilderError::Initialization {
                id: unit.id().to_owned(),
                source,
            })
    }

    /// Registers every unit, announces the system to the lookup service and moves
    /// it to INITIALIZED.
    pub fn build(self) -> Result<System, BuilderError> {
        for unit in &self.units {
            if unit.state() == LifecycleState::Uninitialized {
                self.initialize(unit, Configuration::empty())?;
            }
        }

        self.system.add_units(self.units)?;
        if let Some(lookup) = &self.lookup {
            lookup.register_local_context(&self.system);
        }
        self.system.set_state(LifecycleState::Initialized);
        info!(system = %self.system.id(), units = self.system.unit_count(), "System built");
        Ok(self.system)
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("system", &self.system.id())
            .field("units", &self.ids)
            .field("factories", &self.factories)
            .finish()
    }
}
