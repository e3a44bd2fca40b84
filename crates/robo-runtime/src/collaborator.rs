//! # External Collaborators
//!
//! Seams for the pieces that live outside the runtime: lookup/discovery, the
//! message relay server and the periodic context emitter. All of them are optional.
//! A system without them behaves exactly like one whose collaborators do nothing.

use std::time::Duration;

use crate::error::RelayError;
use crate::system::System;

/// Registers a built system with a lookup/discovery service.
pub trait LookupService: Send + Sync {
    /// Called once, from [`Builder::build`](crate::Builder::build).
    fn register_local_context(&self, context: &System);
}

/// Relays messages between this process and the network.
pub trait MessageRelay: Send + Sync {
    /// Called on every system start, on the blocking pool. A failure is logged and
    /// the system carries on without the relay.
    fn start(&self) -> Result<(), RelayError>;

    fn stop(&self);
}

/// Periodically announces the system, for example on the local network.
pub trait ContextEmitter: Send + Sync {
    fn emit(&self);

    /// Period between two emits, unless the system configuration overrides it.
    fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
