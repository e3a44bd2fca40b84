//! # Lifecycle States
//!
//! Every unit and every system carries one [`LifecycleState`]. The intended
//! progression is
//!
//! ```text
//! UNINITIALIZED -> INITIALIZED -> STARTING -> STARTED -> STOPPING -> STOPPED -> SHUTTING_DOWN -> SHUTDOWN
//!                                     ^                                  |
//!                                     +----------------------------------+
//! ```
//!
//! A stopped system may be started again any number of times. SHUTDOWN is final.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Initialized = 1,
    Starting = 2,
    Started = 3,
    Stopping = 4,
    Stopped = 5,
    ShuttingDown = 6,
    Shutdown = 7,
}

impl LifecycleState {
    /// Whether messages sent while the system is in this state are delivered.
    ///
    /// STOPPED is part of the set so that administrative messages can still reach
    /// units of a stopped system. INITIALIZED and STARTING are not.
    pub fn accepts_messages(self) -> bool {
        matches!(self, Self::Started | Self::Stopping | Self::Stopped)
    }

    /// SHUTTING_DOWN and SHUTDOWN; no way back to STARTED from here.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Initialized,
            2 => Self::Starting,
            3 => Self::Started,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Initialized => "INITIALIZED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// A [`LifecycleState`] that can be shared between threads.
///
/// Guarded transitions go through [`compare_and_set`](Self::compare_and_set);
/// unconditional ones through [`store`](Self::store).
#[derive(Debug)]
pub struct AtomicLifecycleState(AtomicU8);

impl AtomicLifecycleState {
    pub fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves to `new` only if the current state is `current`.
    pub fn compare_and_set(&self, current: LifecycleState, new: LifecycleState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for AtomicLifecycleState {
    fn default() -> Self {
        Self::new(LifecycleState::Uninitialized)
    }
}
