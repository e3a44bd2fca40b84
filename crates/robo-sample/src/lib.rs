//! # Robo Sample
//!
//! Consumer units built on `robo_runtime`, and the demo system the `robo-sample`
//! binary runs.
//!
//! - [`counter_unit`]: a timer-driven counter that reports to a target unit.
//! - [`string_units`]: a string producer and a recording consumer.
//! - [`logger_unit`]: logs every payload from the blocking pool.
//! - [`lifecycle`]: unit factories, declarations and the [`DemoSystem`](lifecycle::DemoSystem).

pub mod counter_unit;
pub mod lifecycle;
pub mod logger_unit;
pub mod string_units;
