use std::time::{Duration, Instant};

use robo_runtime::probe::ProbeUnit;
use robo_runtime::system::keys;
use robo_runtime::tracing::try_setup_tracing;
use robo_runtime::{
    Builder, Configuration, ContextExt, DeliveryPolicy, LifecycleState, UnitDeclaration,
};
use robo_sample::counter_unit::{self, CounterCommand, CounterUnit};
use robo_sample::lifecycle::{classes, factories, ids, DemoSettings, DemoSystem};
use robo_sample::logger_unit::LoggerUnit;
use robo_sample::string_units::{StringConsumer, StringProducer};

const WAIT: Duration = Duration::from_secs(5);

fn runtime_config() -> Configuration {
    Configuration::builder()
        .add_integer(keys::SCHEDULER_POOL_SIZE, 2)
        .add_integer(keys::WORKER_POOL_SIZE, 2)
        .add_integer(keys::BLOCKING_POOL_SIZE, 2)
        .add_integer(keys::SHUTDOWN_TIMEOUT_MS, 2000)
        .build()
}

fn builder(uid: &str) -> Builder {
    try_setup_tracing();
    Builder::with_configuration(uid, &runtime_config()).expect("Failed to create builder")
}

fn eventually(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn counter_config(target: &str, interval_ms: i64) -> Configuration {
    Configuration::builder()
        .add_string(counter_unit::KEY_TARGET, target)
        .add_integer(counter_unit::KEY_INTERVAL, interval_ms)
        .build()
}

#[test]
fn counter_reports_to_its_target_until_stopped() {
    let (sink, probe) = ProbeUnit::<i64>::new();
    let mut builder = builder("counter");
    builder
        .add("sink", sink)
        .and_then(|b| b.add_configured("counter", CounterUnit::new(), counter_config("sink", 5)))
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let counter = system
        .reference::<CounterCommand>("counter")
        .expect("registered");
    counter.send_message(CounterCommand::Start);
    assert!(probe.wait_for(3, WAIT));
    assert_eq!(probe.received()[..3], [0, 1, 2]);

    counter.send_message(CounterCommand::Stop);
    std::thread::sleep(Duration::from_millis(50));
    let after_stop = probe.received_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.received_count(), after_stop);

    let value = counter
        .get_attribute(&CounterUnit::COUNTER)
        .wait()
        .expect("counter");
    assert!(value >= 3, "counter at {value}");

    counter.send_message(CounterCommand::Reset);
    assert!(eventually(WAIT, || {
        counter.get_attribute(&CounterUnit::COUNTER).wait() == Ok(0)
    }));
    system.shutdown();
}

#[test]
fn counter_with_a_missing_target_fails_its_start_command() {
    let mut builder = builder("counter-missing-target");
    builder
        .add_configured("counter", CounterUnit::new(), counter_config("nobody", 5))
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let counter = system
        .reference::<CounterCommand>("counter")
        .expect("registered");
    counter.send_message(CounterCommand::Start);
    assert!(eventually(WAIT, || counter.failure_count() == 1));
    system.shutdown();
}

#[test]
fn logger_counts_payloads_on_the_blocking_pool() {
    let mut builder = builder("logger");
    builder.add("log", LoggerUnit::<String>::new()).expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let log = system.reference::<String>("log").expect("registered");
    assert_eq!(log.delivery_policy(), DeliveryPolicy::Blocking);
    for line in ["left motor on", "right motor on"] {
        log.send_message(line.to_owned());
    }
    assert!(eventually(WAIT, || {
        log.get_attribute(&LoggerUnit::<String>::LOGGED).wait() == Ok(2)
    }));
    system.shutdown();
}

#[test]
fn string_logger_is_declared_by_class() {
    let mut builder = builder("declared-logger").with_factories(factories());
    builder
        .add_declared([UnitDeclaration {
            id: "journal".to_owned(),
            class: classes::LOGGER.to_owned(),
            configuration: None,
        }])
        .expect("declared");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let journal = system.reference::<String>("journal").expect("string logger");
    assert!(system.reference::<i64>("journal").is_none());
    journal.send_message("battery low".to_owned());
    assert!(eventually(WAIT, || {
        journal.get_attribute(&LoggerUnit::<String>::LOGGED).wait() == Ok(1)
    }));
    system.shutdown();
}

#[test]
fn demo_system_moves_strings_from_producer_to_consumer() {
    try_setup_tracing();
    let settings = DemoSettings {
        uid: Some("demo".to_owned()),
        runtime: runtime_config(),
        counter_interval: Duration::from_millis(10),
        messages: 5,
        message_period: Duration::from_millis(5),
    };
    let demo = DemoSystem::new(&settings).expect("Failed to build demo");
    assert_eq!(demo.system().id(), "demo");
    assert_eq!(demo.system().state(), LifecycleState::Initialized);
    assert_eq!(demo.system().unit_count(), 4);
    assert_eq!(demo.consumer().delivery_policy(), DeliveryPolicy::Work);

    demo.start().expect("Failed to start demo");
    assert!(eventually(WAIT, || {
        demo.consumer()
            .get_attribute(&StringConsumer::TOTAL_MESSAGES)
            .wait()
            == Ok(5)
    }));
    let received = demo
        .consumer()
        .get_attribute(&StringConsumer::RECEIVED_MESSAGES)
        .wait()
        .expect("received messages");
    assert_eq!(received.len(), 5);
    assert!(received.iter().all(|message| message.len() == 10));
    assert_eq!(
        demo.producer()
            .get_attribute(&StringProducer::TOTAL_MESSAGES)
            .wait(),
        Ok(5)
    );

    let count_logger = demo
        .system()
        .get_reference(ids::COUNT_LOGGER)
        .expect("registered");
    assert!(eventually(WAIT, || {
        count_logger
            .get_attribute(&LoggerUnit::<i64>::LOGGED)
            .wait()
            .is_ok_and(|logged| logged >= 2)
    }));

    demo.shutdown();
    assert_eq!(demo.system().state(), LifecycleState::Shutdown);
    assert_eq!(demo.counter().state(), LifecycleState::Shutdown);
}
