//! # Probe Unit
//!
//! A recording unit for tests. [`ProbeUnit::new`] returns the unit, to be handed to
//! a [`Builder`](crate::Builder), and a [`Probe`] that stays with the test and
//! observes what the unit went through.
//!
//! | Observation | API |
//! |-------------|-----|
//! | messages received, in order | [`Probe::received`], [`Probe::wait_for`] |
//! | lifecycle hooks and the state seen in each | [`Probe::events`], [`Probe::hook_count`] |
//! | pool threads that ran a message | [`Probe::threads`] |
//! | peak number of concurrent messages | [`Probe::max_concurrency`] |
//!
//! Fault injection, applied after the probe has recorded what it saw:
//!
//! * [`ProbeUnit::failing`]: every `on_message` returns an error;
//! * [`ProbeUnit::panicking`]: every `on_message` panics;
//! * [`ProbeUnit::panicking_in`]: the given lifecycle hook panics;
//! * [`ProbeUnit::panicking_on_read`]: attribute reads panic.
//!
//! ```rust
//! use std::time::Duration;
//! use robo_runtime::probe::ProbeUnit;
//! use robo_runtime::{Builder, ContextExt};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (echo, probe) = ProbeUnit::<String>::new();
//! let mut builder = Builder::new()?;
//! builder.add("echo", echo)?;
//! let system = builder.build()?;
//! system.start()?;
//!
//! let echo = system.reference::<String>("echo").expect("registered");
//! echo.send_message("x".to_owned());
//! assert!(probe.wait_for(1, Duration::from_secs(5)));
//! assert_eq!(probe.received(), vec!["x".to_owned()]);
//!
//! system.shutdown();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::attribute::{AttributeDescriptor, AttributeKey, AttributeValue};
use crate::configuration::Configuration;
use crate::error::{ConfigurationError, UnitError};
use crate::lifecycle::LifecycleState;
use crate::unit::{Unit, UnitContext};

/// Lifecycle hook observed by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Initialize,
    Start,
    Stop,
    Shutdown,
}

/// One hook invocation and the unit state at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEvent {
    pub hook: Hook,
    pub state: LifecycleState,
}

struct ProbeState<M> {
    received: Mutex<Vec<M>>,
    arrived: Condvar,
    events: Mutex<Vec<ProbeEvent>>,
    threads: Mutex<Vec<String>>,
    fail: AtomicBool,
    panic_on_message: AtomicBool,
    panic_on_read: AtomicBool,
    panic_hooks: Mutex<Vec<Hook>>,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl<M> ProbeState<M> {
    fn record_event(&self, hook: Hook, ctx: &UnitContext<'_>) {
        self.events.lock().push(ProbeEvent {
            hook,
            state: ctx.state(),
        });
        if self.panic_hooks.lock().contains(&hook) {
            panic!("probe {} panics in {hook:?}", ctx.id());
        }
    }
}

pub struct ProbeUnit<M> {
    state: Arc<ProbeState<M>>,
}

/// Test-side view of a [`ProbeUnit`].
pub struct Probe<M> {
    state: Arc<ProbeState<M>>,
}

impl<M> Clone for Probe<M> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<M: Send + 'static> ProbeUnit<M> {
    pub const RECEIVED_COUNT: AttributeDescriptor<usize> =
        AttributeDescriptor::new("received_count");

    pub fn new() -> (Self, Probe<M>) {
        let state = Arc::new(ProbeState {
            received: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            events: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            panic_on_message: AtomicBool::new(false),
            panic_on_read: AtomicBool::new(false),
            panic_hooks: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        (
            Self {
                state: state.clone(),
            },
            Probe { state },
        )
    }

    /// Every message handled by this unit ends in an error.
    pub fn failing(self) -> Self {
        self.state.fail.store(true, Ordering::SeqCst);
        self
    }

    /// Every message handled by this unit panics.
    pub fn panicking(self) -> Self {
        self.state.panic_on_message.store(true, Ordering::SeqCst);
        self
    }

    /// `hook` panics each time it runs. May be applied for several hooks.
    pub fn panicking_in(self, hook: Hook) -> Self {
        self.state.panic_hooks.lock().push(hook);
        self
    }

    pub fn panicking_on_read(self) -> Self {
        self.state.panic_on_read.store(true, Ordering::SeqCst);
        self
    }

    /// Each message takes at least `delay` to handle.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock() = Some(delay);
        self
    }
}

impl<M: Send + 'static> Unit for ProbeUnit<M> {
    type Message = M;

    fn on_initialization(
        &self,
        ctx: &UnitContext<'_>,
        _config: &Configuration,
    ) -> Result<(), ConfigurationError> {
        self.state.record_event(Hook::Initialize, ctx);
        Ok(())
    }

    fn start(&self, ctx: &UnitContext<'_>) {
        self.state.record_event(Hook::Start, ctx);
    }

    fn stop(&self, ctx: &UnitContext<'_>) {
        self.state.record_event(Hook::Stop, ctx);
    }

    fn shutdown(&self, ctx: &UnitContext<'_>) {
        self.state.record_event(Hook::Shutdown, ctx);
    }

    fn on_message(&self, ctx: &UnitContext<'_>, message: M) -> Result<(), UnitError> {
        let state = &self.state;
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);
        if let Some(name) = std::thread::current().name() {
            state.threads.lock().push(name.to_owned());
        }

        let delay = *state.delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        state.active.fetch_sub(1, Ordering::SeqCst);
        state.received.lock().push(message);
        state.arrived.notify_all();

        if state.panic_on_message.load(Ordering::SeqCst) {
            panic!("probe {} panics on every message", ctx.id());
        }
        if state.fail.load(Ordering::SeqCst) {
            return Err(format!("probe {} rejects every message", ctx.id()).into());
        }
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Self::RECEIVED_COUNT.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        if self.state.panic_on_read.load(Ordering::SeqCst) {
            panic!("probe attribute {} cannot be read", key.name());
        }
        key.matches(&Self::RECEIVED_COUNT)
            .then(|| Self::RECEIVED_COUNT.value(self.state.received.lock().len()))
    }
}

impl<M: Clone> Probe<M> {
    pub fn received(&self) -> Vec<M> {
        self.state.received.lock().clone()
    }
}

impl<M> Probe<M> {
    pub fn received_count(&self) -> usize {
        self.state.received.lock().len()
    }

    /// Blocks until at least `count` messages arrived or `timeout` passed. Returns
    /// whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut received = self.state.received.lock();
        while received.len() < count {
            if self
                .state
                .arrived
                .wait_until(&mut received, deadline)
                .timed_out()
            {
                return received.len() >= count;
            }
        }
        true
    }

    pub fn events(&self) -> Vec<ProbeEvent> {
        self.state.events.lock().clone()
    }

    pub fn hook_count(&self, hook: Hook) -> usize {
        self.state
            .events
            .lock()
            .iter()
            .filter(|event| event.hook == hook)
            .count()
    }

    pub fn threads(&self) -> Vec<String> {
        self.state.threads.lock().clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}
