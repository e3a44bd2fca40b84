//! # Robo Runtime
//!
//! A local, actor-style runtime for control software. Independently addressable
//! **units** exchange typed messages, each unit walks an explicit lifecycle, and
//! message delivery is routed across three pools according to static per-type policy.
//!
//! ## Architecture Overview
//!
//! 1. **Unit layer** ([`Unit`]): your behavior. Identity, typed inbox, configuration,
//!    lifecycle hooks and attribute accessors.
//! 2. **Addressing layer** ([`Reference`], [`AnyReference`]): the handle callers use.
//!    Carries the delivery and threading policy fixed at creation.
//! 3. **Runtime layer** ([`System`], via the [`Context`] facade): registry, reference
//!    cache, pools, and the global lifecycle state machine.
//! 4. **Assembly** ([`Builder`]): collects units and freezes the system into
//!    INITIALIZED.
//!
//! ```text
//!   caller ──send_message──▶ Reference ──(delivery policy)──▶ scheduler │ work │ blocking
//!                                                                 │
//!                                                                 ▼
//!                                                    Unit::on_message (contained)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use robo_runtime::{Builder, ContextExt, Unit, UnitContext, UnitError};
//!
//! struct Odometer {
//!     meters: Arc<AtomicU64>,
//! }
//!
//! impl Unit for Odometer {
//!     type Message = u64;
//!
//!     fn on_message(&self, _ctx: &UnitContext<'_>, meters: u64) -> Result<(), UnitError> {
//!         self.meters.fetch_add(meters, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let meters = Arc::new(AtomicU64::new(0));
//! let mut builder = Builder::new()?;
//! builder.add("odometer", Odometer { meters: meters.clone() })?;
//! let system = builder.build()?;
//! system.start()?;
//!
//! let odometer = system.reference::<u64>("odometer").expect("registered");
//! odometer.send_message(12);
//! # for _ in 0..500 {
//! #     if meters.load(Ordering::SeqCst) == 12 { break; }
//! #     std::thread::sleep(Duration::from_millis(10));
//! # }
//!
//! system.shutdown();
//! assert_eq!(meters.load(Ordering::SeqCst), 12);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! - The system owns its threads; its API is synchronous and callable from any thread.
//! - `send_message` never blocks: it queues on an unbounded pool queue or drops the
//!   message when the system is not accepting messages.
//! - Units with [`ThreadingPolicy::Normal`] may handle several messages at once;
//!   [`ThreadingPolicy::Critical`] units handle one at a time.
//! - A unit that fails or panics never takes down a pool thread or another unit.
//!
//! ## Testing
//!
//! The [`probe`] module ships a recording unit for tests, in the same way production
//! units are used: build a system with it, send messages, observe.

pub mod attribute;
pub mod builder;
pub mod collaborator;
pub mod configuration;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod probe;
pub mod reference;
pub mod scheduler;
pub mod system;
pub mod tracing;
pub mod unit;

// Re-export core types for convenience
pub use attribute::{AttributeDescriptor, AttributeFuture, AttributeKey, AttributeMap, AttributeValue};
pub use builder::{Builder, UnitDeclaration, UnitFactories};
pub use collaborator::{ContextEmitter, LookupService, MessageRelay};
pub use configuration::{Configuration, ConfigurationBuilder, Value};
pub use context::{Context, ContextExt};
pub use error::{AttributeError, BuilderError, ConfigurationError, RelayError, SystemError, UnitError};
pub use lifecycle::{AtomicLifecycleState, LifecycleState};
pub use reference::{AnyReference, DeliveryPolicy, Reference, ThreadingPolicy};
pub use scheduler::{ExecutorPool, PoolKind, PoolSizes, ScheduledTask, Scheduler, TaskResult};
pub use system::System;
pub use unit::{MessageType, Unit, UnitContext, UnitHandle};
