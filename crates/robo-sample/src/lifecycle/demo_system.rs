use std::time::Duration;

use parking_lot::Mutex;
use robo_runtime::{
    AnyReference, Builder, BuilderError, Configuration, ContextExt, Reference, ScheduledTask,
    System, SystemError, UnitDeclaration, UnitFactories,
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::counter_unit::{self, CounterCommand, CounterUnit};
use crate::logger_unit::LoggerUnit;
use crate::string_units::{self, ProducerCommand, StringConsumer, StringProducer};

/// Unit ids used by the demo.
pub mod ids {
    pub const COUNTER: &str = "counter";
    pub const COUNT_LOGGER: &str = "count_logger";
    pub const PRODUCER: &str = "producer";
    pub const CONSUMER: &str = "consumer";
}

/// Class names understood by [`factories`].
pub mod classes {
    pub const COUNTER: &str = "counter";
    pub const COUNT_LOGGER: &str = "count_logger";
    pub const LOGGER: &str = "logger";
    pub const STRING_PRODUCER: &str = "string_producer";
    pub const STRING_CONSUMER: &str = "string_consumer";
}

#[derive(Debug, Error)]
pub enum DemoError {
    #[error("failed to build the demo system: {0}")]
    Build(#[from] BuilderError),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error("unit {id} is missing or does not accept {expected}")]
    Unit { id: String, expected: &'static str },
}

#[derive(Debug, Clone)]
pub struct DemoSettings {
    /// System id. A random one is used when absent.
    pub uid: Option<String>,
    /// Runtime configuration (pool sizes, shutdown timeout, emitter).
    pub runtime: Configuration,
    pub counter_interval: Duration,
    /// Strings the producer sends after start. Zero disables the producer schedule.
    pub messages: u64,
    pub message_period: Duration,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            uid: None,
            runtime: Configuration::empty(),
            counter_interval: Duration::from_millis(
                counter_unit::DEFAULT_INTERVAL_MS.unsigned_abs(),
            ),
            messages: 10,
            message_period: Duration::from_millis(500),
        }
    }
}

/// Every sample unit class.
pub fn factories() -> UnitFactories {
    let mut factories = UnitFactories::new();
    factories
        .register(classes::COUNTER, CounterUnit::new)
        .register(classes::COUNT_LOGGER, LoggerUnit::<i64>::new)
        .register(classes::LOGGER, LoggerUnit::<String>::new)
        .register(classes::STRING_PRODUCER, StringProducer::new)
        .register(classes::STRING_CONSUMER, StringConsumer::new);
    factories
}

/// The demo units as declarations.
pub fn declarations(settings: &DemoSettings) -> Vec<UnitDeclaration> {
    let interval = i64::try_from(settings.counter_interval.as_millis()).unwrap_or(i64::MAX);
    let declare = |id: &str, class: &str, configuration: Option<Configuration>| UnitDeclaration {
        id: id.to_owned(),
        class: class.to_owned(),
        configuration,
    };
    vec![
        declare(ids::COUNT_LOGGER, classes::COUNT_LOGGER, None),
        declare(
            ids::COUNTER,
            classes::COUNTER,
            Some(
                Configuration::builder()
                    .add_string(counter_unit::KEY_TARGET, ids::COUNT_LOGGER)
                    .add_integer(counter_unit::KEY_INTERVAL, interval)
                    .build(),
            ),
        ),
        declare(ids::CONSUMER, classes::STRING_CONSUMER, None),
        declare(
            ids::PRODUCER,
            classes::STRING_PRODUCER,
            Some(
                Configuration::builder()
                    .add_string(string_units::KEY_TARGET, ids::CONSUMER)
                    .build(),
            ),
        ),
    ]
}

fn typed<M: Send + 'static>(
    system: &System,
    id: &str,
    expected: &'static str,
) -> Result<Reference<M>, DemoError> {
    system.reference::<M>(id).ok_or_else(|| DemoError::Unit {
        id: id.to_owned(),
        expected,
    })
}

/// The demo system and the references it drives.
pub struct DemoSystem {
    system: System,
    counter: Reference<CounterCommand>,
    producer: Reference<ProducerCommand>,
    consumer: AnyReference,
    messages: u64,
    message_period: Duration,
    production: Mutex<Option<ScheduledTask>>,
}

impl DemoSystem {
    /// Builds the system in INITIALIZED. Nothing runs until [`start`](Self::start).
    pub fn new(settings: &DemoSettings) -> Result<Self, DemoError> {
        let uid = settings
            .uid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut builder =
            Builder::with_configuration(uid, &settings.runtime)?.with_factories(factories());
        builder.add_declared(declarations(settings))?;
        let system = builder.build()?;

        let counter = typed(&system, ids::COUNTER, "counter commands")?;
        let producer = typed(&system, ids::PRODUCER, "producer commands")?;
        let consumer = typed::<String>(&system, ids::CONSUMER, "strings")?.into_any();

        Ok(Self {
            system,
            counter,
            producer,
            consumer,
            messages: settings.messages,
            message_period: settings.message_period,
            production: Mutex::new(None),
        })
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn counter(&self) -> &Reference<CounterCommand> {
        &self.counter
    }

    pub fn producer(&self) -> &Reference<ProducerCommand> {
        &self.producer
    }

    pub fn consumer(&self) -> &AnyReference {
        &self.consumer
    }

    /// Starts the system, the counter and the producer schedule.
    pub fn start(&self) -> Result<(), DemoError> {
        self.system.start()?;
        self.counter.send_message(CounterCommand::Start);

        if self.messages > 0 {
            let task = self.system.scheduler().schedule_message(
                &self.producer,
                ProducerCommand::SendRandom,
                Duration::ZERO,
                self.message_period,
                Some(self.messages),
            );
            if let Some(previous) = self.production.lock().replace(task) {
                previous.cancel();
            }
        }
        info!(system = %self.system.id(), messages = self.messages, "Demo started");
        Ok(())
    }

    /// Runs the ordered system shutdown. Blocks until the pools have drained or the
    /// configured shutdown timeout passed.
    pub fn shutdown(&self) {
        if let Some(task) = self.production.lock().take() {
            task.cancel();
        }
        self.system.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_declared_class_is_registered() {
        let factories = factories();
        for declaration in declarations(&DemoSettings::default()) {
            assert!(
                factories.contains(&declaration.class),
                "{} has no factory",
                declaration.class
            );
        }
    }

    #[test]
    fn counter_declaration_carries_the_interval() {
        let settings = DemoSettings {
            counter_interval: Duration::from_millis(250),
            ..DemoSettings::default()
        };
        let counter = declarations(&settings)
            .into_iter()
            .find(|d| d.id == ids::COUNTER)
            .and_then(|d| d.configuration)
            .expect("counter configuration");
        assert_eq!(counter.get_integer(counter_unit::KEY_INTERVAL, 0), 250);
        assert_eq!(
            counter.get_string(counter_unit::KEY_TARGET, ""),
            ids::COUNT_LOGGER
        );
    }
}
