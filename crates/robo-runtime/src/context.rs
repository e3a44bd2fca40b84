//! # Context
//!
//! The facade a unit or an outside caller uses to find references, drive the
//! system lifecycle and reach the scheduler. [`System`](crate::System) is the
//! implementation; code that only needs the facade can take `&dyn Context`.

use crate::configuration::Configuration;
use crate::error::SystemError;
use crate::lifecycle::LifecycleState;
use crate::reference::{AnyReference, Reference};
use crate::scheduler::Scheduler;

pub trait Context: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> LifecycleState;

    fn configuration(&self) -> Configuration;

    /// Starts every unit. Valid from INITIALIZED or STOPPED; a no-op for the units
    /// when already STARTED.
    fn start(&self) -> Result<(), SystemError>;

    fn stop(&self);

    /// Stops, then shuts every unit and pool down. Irreversible.
    fn shutdown(&self);

    fn scheduler(&self) -> Scheduler;

    /// Reference to the unit registered under `id`, if any.
    fn get_reference(&self, id: &str) -> Option<AnyReference>;

    /// References to every registered unit, in registration order.
    fn get_units(&self) -> Vec<AnyReference>;
}

/// Typed lookups for any [`Context`].
pub trait ContextExt: Context {
    /// Typed reference to the unit `id`. `None` when no such unit exists or its
    /// messages are not of type `M`.
    fn reference<M: Send + 'static>(&self, id: &str) -> Option<Reference<M>> {
        self.get_reference(id)?.typed()
    }
}

impl<C: Context + ?Sized> ContextExt for C {}
