//! # Configuration
//!
//! Hierarchical, typed key/value store handed to units at initialization and to the
//! system at construction. A configuration is immutable once built; cloning shares
//! the underlying data.
//!
//! ```
//! use robo_runtime::Configuration;
//!
//! let config = Configuration::builder()
//!     .add_string("target", "logger")
//!     .add_integer("interval", 250)
//!     .add_child("emitter", Configuration::builder().add_boolean("enabled", true))
//!     .build();
//!
//! assert_eq!(config.get_integer("interval", 1000), 250);
//! assert!(config.get_child("emitter").is_some_and(|c| c.get_boolean("enabled", false)));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// A single configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ConfigurationData {
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    children: BTreeMap<String, Configuration>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "ConfigurationData", into = "ConfigurationData")]
pub struct Configuration {
    inner: Arc<ConfigurationData>,
}

impl From<ConfigurationData> for Configuration {
    fn from(data: ConfigurationData) -> Self {
        Self {
            inner: Arc::new(data),
        }
    }
}

impl From<Configuration> for ConfigurationData {
    fn from(config: Configuration) -> Self {
        Arc::unwrap_or_clone(config.inner)
    }
}

impl Configuration {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.inner.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.values.contains_key(key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.value(key) {
            Some(Value::String(v)) => v.clone(),
            _ => default.to_owned(),
        }
    }

    pub fn get_integer(&self, key: &str, default: i64) -> i64 {
        match self.value(key) {
            Some(Value::Integer(v)) => *v,
            _ => default,
        }
    }

    /// Integers are widened.
    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        match self.value(key) {
            Some(Value::Float(v)) => *v,
            Some(Value::Integer(v)) => *v as f64,
            _ => default,
        }
    }

    pub fn get_boolean(&self, key: &str, default: bool) -> bool {
        match self.value(key) {
            Some(Value::Boolean(v)) => *v,
            _ => default,
        }
    }

    pub fn require_string(&self, key: &str) -> Result<String, ConfigurationError> {
        match self.value(key) {
            Some(Value::String(v)) => Ok(v.clone()),
            Some(other) => Err(ConfigurationError::invalid(
                key,
                format!("expected a string, found {other}"),
            )),
            None => Err(ConfigurationError::missing(key)),
        }
    }

    pub fn require_integer(&self, key: &str) -> Result<i64, ConfigurationError> {
        match self.value(key) {
            Some(Value::Integer(v)) => Ok(*v),
            Some(other) => Err(ConfigurationError::invalid(
                key,
                format!("expected an integer, found {other}"),
            )),
            None => Err(ConfigurationError::missing(key)),
        }
    }

    pub fn get_child(&self, key: &str) -> Option<Configuration> {
        self.inner.children.get(key).cloned()
    }

    /// Names of all plain values, in sorted order.
    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.inner.values.keys().map(String::as_str)
    }

    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.inner.children.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.is_empty() && self.inner.children.is_empty()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("values", &self.inner.values)
            .field("children", &self.inner.children)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    data: ConfigurationData,
}

impl ConfigurationBuilder {
    pub fn add_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.values.insert(key.into(), value);
        self
    }

    pub fn add_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_value(key, Value::String(value.into()))
    }

    pub fn add_integer(self, key: impl Into<String>, value: i64) -> Self {
        self.add_value(key, Value::Integer(value))
    }

    pub fn add_float(self, key: impl Into<String>, value: f64) -> Self {
        self.add_value(key, Value::Float(value))
    }

    pub fn add_boolean(self, key: impl Into<String>, value: bool) -> Self {
        self.add_value(key, Value::Boolean(value))
    }

    pub fn add_child(mut self, key: impl Into<String>, child: ConfigurationBuilder) -> Self {
        self.data.children.insert(key.into(), child.build());
        self
    }

    pub fn build(self) -> Configuration {
        Configuration::from(self.data)
    }
}
