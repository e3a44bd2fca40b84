//! # Counter Unit
//!
//! Counts up on a timer and sends each value to a target unit.
//!
//! | Key | Required | Meaning |
//! |-----|----------|---------|
//! | `target` | yes | id of the unit receiving the counts (`i64` inbox) |
//! | `interval` | no | milliseconds between counts, default 1000 |
//!
//! The counter is driven by [`CounterCommand`]s: `Start` schedules the updates on the
//! system scheduler, `Stop` cancels them and `Reset` sets the counter back to zero.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use robo_runtime::{
    AttributeDescriptor, AttributeKey, AttributeValue, Configuration, ConfigurationError,
    ScheduledTask, ThreadingPolicy, Unit, UnitContext, UnitError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub const KEY_TARGET: &str = "target";
pub const KEY_INTERVAL: &str = "interval";
pub const DEFAULT_INTERVAL_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterCommand {
    Start,
    Stop,
    Reset,
}

#[derive(Default)]
pub struct CounterUnit {
    counter: Arc<AtomicI64>,
    updates: Mutex<Option<ScheduledTask>>,
}

impl CounterUnit {
    pub const COUNTER: AttributeDescriptor<i64> = AttributeDescriptor::new("counter");

    pub fn new() -> Self {
        Self::default()
    }

    fn interval(config: &Configuration) -> Duration {
        let millis = config.get_integer(KEY_INTERVAL, DEFAULT_INTERVAL_MS);
        Duration::from_millis(u64::try_from(millis).unwrap_or_default())
    }

    fn start_updates(&self, ctx: &UnitContext<'_>) -> Result<(), UnitError> {
        let config = ctx.configuration();
        let target_id = config.get_string(KEY_TARGET, "");
        let target = ctx.reference::<i64>(&target_id).ok_or_else(|| {
            error!(unit = %ctx.id(), target = %target_id, "Counter target does not exist");
            format!("counter target {target_id} does not exist")
        })?;
        let scheduler = ctx
            .scheduler()
            .ok_or_else(|| format!("counter {} is not part of a system", ctx.id()))?;

        let counter = self.counter.clone();
        let task = scheduler.schedule_at_fixed_rate(
            move || target.send_message(counter.fetch_add(1, Ordering::SeqCst)),
            Duration::ZERO,
            Self::interval(&config),
        );
        if let Some(previous) = self.updates.lock().replace(task) {
            previous.cancel();
        }
        debug!(unit = %ctx.id(), target = %target_id, "Counter started");
        Ok(())
    }

    fn cancel_updates(&self) {
        if let Some(task) = self.updates.lock().take() {
            task.cancel();
        }
    }
}

impl Unit for CounterUnit {
    type Message = CounterCommand;
    const THREADING: ThreadingPolicy = ThreadingPolicy::Critical;

    fn on_initialization(
        &self,
        _ctx: &UnitContext<'_>,
        config: &Configuration,
    ) -> Result<(), ConfigurationError> {
        config.require_string(KEY_TARGET)?;
        if config.get_integer(KEY_INTERVAL, DEFAULT_INTERVAL_MS) < 0 {
            return Err(ConfigurationError::invalid(
                KEY_INTERVAL,
                "must not be negative",
            ));
        }
        Ok(())
    }

    fn on_message(&self, ctx: &UnitContext<'_>, command: CounterCommand) -> Result<(), UnitError> {
        match command {
            CounterCommand::Start => self.start_updates(ctx)?,
            CounterCommand::Stop => self.cancel_updates(),
            CounterCommand::Reset => self.counter.store(0, Ordering::SeqCst),
        }
        Ok(())
    }

    fn stop(&self, _ctx: &UnitContext<'_>) {
        self.cancel_updates();
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Self::COUNTER.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        key.matches(&Self::COUNTER)
            .then(|| Self::COUNTER.value(self.counter.load(Ordering::SeqCst)))
    }
}
