//! # References
//!
//! A reference is the handle every caller uses to talk to a unit. It never owns the
//! unit: it holds a weak link, while the system's registry holds the only strong one.
//! The system creates exactly one reference per unit and caches it, so repeated
//! lookups return the same instance.
//!
//! ## Policies
//!
//! When a reference is created it reads the unit type's static markers
//! ([`Unit::DELIVERY`](crate::Unit::DELIVERY) and
//! [`Unit::THREADING`](crate::Unit::THREADING)) and fixes two policies for its lifetime:
//!
//! | Policy | Values | Effect |
//! |--------|--------|--------|
//! | [`DeliveryPolicy`] | `System`, `Work`, `Blocking` | pool that dispatches messages |
//! | [`ThreadingPolicy`] | `Normal`, `Critical` | whether message handling is serialized |
//!
//! A `Critical` reference keeps a serial mailbox. Senders append to it, and only the
//! sender that finds it idle submits a drain task to the pool. The drain task handles
//! queued messages in arrival order until the mailbox is empty. Message bodies of one
//! critical unit therefore never overlap, and a busy critical unit occupies at most
//! one pool thread; nothing waits on a lock for its turn.
//!
//! ## Delivery
//!
//! [`Reference::send_message`] never blocks and never fails. The message is queued
//! only while the system is STARTED, STOPPING or STOPPED; in any other state it is
//! dropped without a trace beyond a `trace!` log line.
//!
//! Attribute reads always run on the general scheduler, regardless of the unit's
//! delivery policy.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::attribute::{AttributeDescriptor, AttributeFuture, AttributeKey, AttributeMap};
use crate::configuration::Configuration;
use crate::error::AttributeError;
use crate::lifecycle::{AtomicLifecycleState, LifecycleState};
use crate::scheduler::Pools;
use crate::unit::{panic_message, ErasedUnit, MessageType, UnitHandle};

/// Pool that dispatches a unit's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryPolicy {
    /// The general scheduler.
    #[default]
    System,
    /// The work pool, for CPU-bound or latency-sensitive batches.
    Work,
    /// The blocking pool, for units doing blocking I/O.
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadingPolicy {
    /// Messages are dispatched independently and may run concurrently.
    #[default]
    Normal,
    /// Messages are submitted and run one at a time.
    Critical,
}

type Envelope = Box<dyn Any + Send>;

/// Pending messages of a critical unit.
#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Envelope>,
    /// A drain task owns the queue.
    draining: bool,
}

pub(crate) struct ReferenceCore {
    id: String,
    message_type: MessageType,
    delivery: DeliveryPolicy,
    threading: ThreadingPolicy,
    unit: Weak<dyn ErasedUnit>,
    system_state: Arc<AtomicLifecycleState>,
    pools: Arc<Pools>,
    mailbox: Mutex<Mailbox>,
    failures: AtomicU64,
}

impl ReferenceCore {
    fn unit(&self) -> Option<Arc<dyn ErasedUnit>> {
        self.unit.upgrade()
    }

    fn enqueue(self: &Arc<Self>, unit: Arc<dyn ErasedUnit>, message: Envelope) {
        let pool = self.pools.for_delivery(self.delivery);
        match self.threading {
            ThreadingPolicy::Normal => {
                let core = Arc::clone(self);
                pool.execute(move || core.dispatch(&*unit, message));
            }
            ThreadingPolicy::Critical => {
                {
                    let mut mailbox = self.mailbox.lock();
                    mailbox.queue.push_back(message);
                    if mailbox.draining {
                        return;
                    }
                    mailbox.draining = true;
                }
                let core = Arc::clone(self);
                if !pool.execute(move || core.drain(&*unit)) {
                    let mut mailbox = self.mailbox.lock();
                    trace!(unit = %self.id, dropped = mailbox.queue.len(), "Pool closed, mailbox cleared");
                    mailbox.queue.clear();
                    mailbox.draining = false;
                }
            }
        }
    }

    /// Handles mailbox messages one at a time until the mailbox is empty.
    fn drain(&self, unit: &dyn ErasedUnit) {
        loop {
            let message = {
                let mut mailbox = self.mailbox.lock();
                match mailbox.queue.pop_front() {
                    Some(message) => message,
                    None => {
                        mailbox.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(unit, message);
        }
    }

    /// Runs one message against the unit. Nothing raised by the unit escapes.
    fn dispatch(&self, unit: &dyn ErasedUnit, message: Envelope) {
        match catch_unwind(AssertUnwindSafe(|| unit.deliver(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(unit = %self.id, state = %unit.core().state.load(), error = %e, "Unit failed to handle message");
            }
            Err(panic) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    unit = %self.id,
                    state = %unit.core().state.load(),
                    panic = panic_message(&*panic),
                    "Unit panicked while handling message"
                );
            }
        }
    }

    /// Runs `read` against the unit on the general scheduler.
    fn read<T, F>(&self, name: &str, read: F) -> AttributeFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ErasedUnit) -> Result<T, AttributeError> + Send + 'static,
    {
        let Some(unit) = self.unit() else {
            return AttributeFuture::unavailable(name);
        };
        let (tx, future) = AttributeFuture::channel(name);
        let id = self.id.clone();
        let name = name.to_owned();
        self.pools.scheduler.execute(move || {
            let result = match catch_unwind(AssertUnwindSafe(|| read(&*unit))) {
                Ok(result) => result,
                Err(panic) => {
                    error!(unit = %id, attribute = %name, panic = panic_message(&*panic), "Unit panicked while reading attribute");
                    Err(AttributeError::Unavailable { name })
                }
            };
            let _ = tx.send(result);
        });
        future
    }
}

/// Type-erased reference to a unit. Clones are the same reference.
#[derive(Clone)]
pub struct AnyReference {
    core: Arc<ReferenceCore>,
}

impl AnyReference {
    pub(crate) fn new(
        unit: &UnitHandle,
        system_state: Arc<AtomicLifecycleState>,
        pools: Arc<Pools>,
    ) -> Self {
        trace!(
            unit = %unit.id(),
            delivery = ?unit.delivery_policy(),
            threading = ?unit.threading_policy(),
            "Reference created"
        );
        Self {
            core: Arc::new(ReferenceCore {
                id: unit.id().to_owned(),
                message_type: unit.message_type(),
                delivery: unit.delivery_policy(),
                threading: unit.threading_policy(),
                unit: Arc::downgrade(unit.erased()),
                system_state,
                pools,
                mailbox: Mutex::new(Mailbox::default()),
                failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn message_type(&self) -> MessageType {
        self.core.message_type
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        self.core.delivery
    }

    pub fn threading_policy(&self) -> ThreadingPolicy {
        self.core.threading
    }

    /// The unit's state, or SHUTDOWN once the unit is gone.
    pub fn state(&self) -> LifecycleState {
        self.core
            .unit()
            .map_or(LifecycleState::Shutdown, |unit| unit.core().state.load())
    }

    pub fn configuration(&self) -> Configuration {
        self.core
            .unit()
            .map(|unit| unit.core().configuration())
            .unwrap_or_default()
    }

    pub fn known_attributes(&self) -> Vec<AttributeKey> {
        self.core
            .unit()
            .map(|unit| unit.known_attributes())
            .unwrap_or_default()
    }

    /// Number of messages whose handling failed or panicked.
    pub fn failure_count(&self) -> u64 {
        self.core.failures.load(Ordering::Relaxed)
    }

    /// Typed view of this reference, if `M` is the unit's message type.
    pub fn typed<M: Send + 'static>(&self) -> Option<Reference<M>> {
        self.core.message_type.is::<M>().then(|| Reference {
            any: self.clone(),
            _message: PhantomData,
        })
    }

    pub fn get_attribute<T: Send + 'static>(
        &self,
        descriptor: &AttributeDescriptor<T>,
    ) -> AttributeFuture<T> {
        let key = descriptor.key();
        self.core.read(descriptor.name(), move |unit| {
            let name = key.name().to_owned();
            match unit.get_attribute(&key) {
                Some(value) => value
                    .downcast::<T>()
                    .map(|value| *value)
                    .map_err(|_| AttributeError::TypeMismatch {
                        name,
                        expected: std::any::type_name::<T>(),
                    }),
                None => Err(AttributeError::Unknown { name }),
            }
        })
    }

    pub fn get_attributes(&self) -> AttributeFuture<AttributeMap> {
        self.core.read("*", |unit| {
            let values: HashMap<_, _> = unit.get_attributes();
            Ok(AttributeMap::from(values))
        })
    }

    fn send_erased(&self, message: Envelope) {
        let state = self.core.system_state.load();
        if !state.accepts_messages() {
            trace!(unit = %self.core.id, %state, "System not accepting messages, message dropped");
            return;
        }
        let Some(unit) = self.core.unit() else {
            trace!(unit = %self.core.id, "Unit is gone, message dropped");
            return;
        };
        trace!(unit = %self.core.id, delivery = ?self.core.delivery, "Message queued");
        self.core.enqueue(unit, message);
    }
}

impl PartialEq for AnyReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for AnyReference {}

impl Hash for AnyReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.core).hash(state);
    }
}

impl fmt::Display for AnyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.core.id)
    }
}

impl fmt::Debug for AnyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.core.id)
            .field("message_type", &self.core.message_type.name())
            .field("delivery", &self.core.delivery)
            .field("threading", &self.core.threading)
            .finish()
    }
}

/// Reference to a unit whose messages are of type `M`.
pub struct Reference<M> {
    any: AnyReference,
    _message: PhantomData<fn(M)>,
}

impl<M: Send + 'static> Reference<M> {
    /// Queues `message` for the unit. Never blocks; see the module docs for when
    /// messages are dropped.
    pub fn send_message(&self, message: M) {
        self.any.send_erased(Box::new(message));
    }

    pub fn into_any(self) -> AnyReference {
        self.any
    }
}

impl<M> Deref for Reference<M> {
    type Target = AnyReference;

    fn deref(&self) -> &AnyReference {
        &self.any
    }
}

impl<M> Clone for Reference<M> {
    fn clone(&self) -> Self {
        Self {
            any: self.any.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> PartialEq for Reference<M> {
    fn eq(&self, other: &Self) -> bool {
        self.any == other.any
    }
}

impl<M> Eq for Reference<M> {}

impl<M> fmt::Debug for Reference<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.any, f)
    }
}

impl<M> fmt::Display for Reference<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.any, f)
    }
}
