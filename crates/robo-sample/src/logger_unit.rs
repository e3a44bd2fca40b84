//! Logs every message it receives. Runs on the blocking pool, so a slow log sink
//! never holds up the scheduler.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use robo_runtime::{
    AttributeDescriptor, AttributeKey, AttributeValue, DeliveryPolicy, Unit, UnitContext,
    UnitError,
};
use tracing::info;

pub struct LoggerUnit<M = String> {
    logged: AtomicUsize,
    _message: PhantomData<fn(M)>,
}

impl<M> LoggerUnit<M> {
    pub const LOGGED: AttributeDescriptor<usize> = AttributeDescriptor::new("logged");

    pub fn new() -> Self {
        Self {
            logged: AtomicUsize::new(0),
            _message: PhantomData,
        }
    }
}

impl<M> Default for LoggerUnit<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Unit for LoggerUnit<M>
where
    M: fmt::Display + Send + 'static,
{
    type Message = M;
    const DELIVERY: DeliveryPolicy = DeliveryPolicy::Blocking;

    fn on_message(&self, ctx: &UnitContext<'_>, message: M) -> Result<(), UnitError> {
        info!(unit = %ctx.id(), payload = %message, "Logged");
        self.logged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Self::LOGGED.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        key.matches(&Self::LOGGED)
            .then(|| Self::LOGGED.value(self.logged.load(Ordering::SeqCst)))
    }
}
