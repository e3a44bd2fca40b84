//! # Demo Lifecycle
//!
//! Wires the sample units into one system and drives it through its lifecycle.
//!
//! The units are declared by class name, the way an external declarative source
//! would describe them, and instantiated from [`factories`]:
//!
//! ```text
//!   counter ──i64──▶ count_logger        (scheduled by CounterCommand::Start)
//!   producer ──String──▶ consumer        (scheduled ProducerCommand::SendRandom)
//! ```
//!
//! [`DemoSystem`] owns the built system plus typed references to the units callers
//! drive directly. Shutting it down runs the runtime's ordered shutdown.

pub mod demo_system;

pub use demo_system::*;
