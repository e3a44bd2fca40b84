//! # Runtime Errors
//!
//! Error types shared by the runtime. Configuration and construction errors are
//! synchronous and reach the caller that assembles a system. Errors raised while a
//! unit runs on a pool thread never leave the dispatch boundary; they are logged and
//! counted instead (see [`crate::reference`]).

use crate::lifecycle::LifecycleState;

/// Error type returned by [`Unit::on_message`](crate::Unit::on_message).
///
/// Any error type works here. The runtime only logs it together with the unit id.
pub type UnitError = Box<dyn std::error::Error + Send + Sync>;

/// A unit could not be configured.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("missing required configuration key: {key}")]
    MissingKey { key: String },
    #[error("invalid value for configuration key {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigurationError {
    pub fn missing(key: impl Into<String>) -> Self {
        Self::MissingKey { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The configuration key the error refers to.
    pub fn key(&self) -> &str {
        match self {
            Self::MissingKey { key } | Self::InvalidValue { key, .. } => key,
        }
    }
}

/// Errors raised by the [`System`](crate::System) itself.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("all units must be registered up front (system state: {state})")]
    Frozen { state: LifecycleState },
    #[error("only one unit with the id {id} can be registered")]
    DuplicateId { id: String },
    #[error("cannot {operation} a system in state {state}")]
    InvalidTransition {
        state: LifecycleState,
        operation: &'static str,
    },
    #[error("could not create the {name}: {source}")]
    Pool {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Construction errors raised while assembling a system with the
/// [`Builder`](crate::Builder).
#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("cannot add a missing unit")]
    NullUnit,
    #[error("only one unit with the id {id} can be active at a time")]
    DuplicateId { id: String },
    #[error("no unit class registered under the name {class}")]
    UnknownClass { class: String },
    #[error("error initializing unit {id}: {source}")]
    Initialization {
        id: String,
        #[source]
        source: ConfigurationError,
    },
    #[error(transparent)]
    Registration(#[from] SystemError),
}

/// Errors resolving an attribute read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute {name} is not available")]
    Unavailable { name: String },
    #[error("attribute {name} is not exposed by the unit")]
    Unknown { name: String },
    #[error("attribute {name} does not hold a value of type {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Failure reported by an external message relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay error: {0}")]
    Other(String),
}
