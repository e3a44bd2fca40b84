use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use robo_runtime::probe::ProbeUnit;
use robo_runtime::system::keys;
use robo_runtime::tracing::try_setup_tracing;
use robo_runtime::{
    AttributeDescriptor, AttributeError, AttributeKey, AttributeValue, Builder, Configuration,
    ConfigurationBuilder, ConfigurationError, ContextEmitter, ContextExt, DeliveryPolicy,
    MessageRelay, RelayError, ThreadingPolicy, Unit, UnitContext, UnitError,
};

const WAIT: Duration = Duration::from_secs(5);

fn builder(uid: &str, extra: impl FnOnce(ConfigurationBuilder) -> ConfigurationBuilder) -> Builder {
    try_setup_tracing();
    let config = extra(
        Configuration::builder()
            .add_integer(keys::SCHEDULER_POOL_SIZE, 2)
            .add_integer(keys::WORKER_POOL_SIZE, 4)
            .add_integer(keys::BLOCKING_POOL_SIZE, 2)
            .add_integer(keys::SHUTDOWN_TIMEOUT_MS, 2000),
    )
    .build();
    Builder::with_configuration(uid, &config).expect("Failed to create builder")
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

fn thread_name() -> String {
    std::thread::current().name().unwrap_or_default().to_owned()
}

#[derive(Default)]
struct GaugeState {
    count: AtomicI64,
    message_threads: Mutex<Vec<String>>,
    attribute_threads: Mutex<Vec<String>>,
}

/// Blocking-I/O unit with an incrementing counter attribute.
struct Gauge(Arc<GaugeState>);

impl Gauge {
    const COUNT: AttributeDescriptor<i64> = AttributeDescriptor::new("count");
}

impl Unit for Gauge {
    type Message = ();
    const DELIVERY: DeliveryPolicy = DeliveryPolicy::Blocking;

    fn on_message(&self, _ctx: &UnitContext<'_>, _: ()) -> Result<(), UnitError> {
        self.0.message_threads.lock().push(thread_name());
        self.0.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn known_attributes(&self) -> Vec<AttributeKey> {
        vec![Gauge::COUNT.key()]
    }

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        self.0.attribute_threads.lock().push(thread_name());
        key.matches(&Gauge::COUNT)
            .then(|| Gauge::COUNT.value(self.0.count.load(Ordering::SeqCst)))
    }
}

#[test]
fn attribute_reads_run_on_the_scheduler() {
    let gauge = Arc::new(GaugeState::default());
    let mut builder = builder("attributes", |c| c);
    builder.add("gauge", Gauge(gauge.clone())).expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let reference = system.reference::<()>("gauge").expect("registered");
    assert_eq!(reference.delivery_policy(), DeliveryPolicy::Blocking);
    assert_eq!(reference.known_attributes(), vec![Gauge::COUNT.key()]);

    reference.send_message(());
    assert!(eventually(WAIT, || gauge.count.load(Ordering::SeqCst) == 1));
    let first = reference.get_attribute(&Gauge::COUNT).wait().expect("count");

    reference.send_message(());
    assert!(eventually(WAIT, || gauge.count.load(Ordering::SeqCst) == 2));
    let second = reference.get_attribute(&Gauge::COUNT).wait().expect("count");

    assert!(second > first, "{second} should exceed {first}");
    assert!(gauge
        .message_threads
        .lock()
        .iter()
        .all(|name| name.starts_with("robo-blocking")));
    let attribute_threads = gauge.attribute_threads.lock().clone();
    assert_eq!(attribute_threads.len(), 2);
    assert!(attribute_threads
        .iter()
        .all(|name| name.starts_with("robo-scheduler")));

    let all = reference.get_attributes().wait().expect("attributes");
    assert_eq!(all.len(), 1);
    assert_eq!(all.get(&Gauge::COUNT), Some(2));

    system.shutdown();
}

#[test]
fn attribute_errors_are_reported() {
    let mut builder = builder("attribute-errors", |c| c);
    builder
        .add("gauge", Gauge(Arc::new(GaugeState::default())))
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    let reference = system.get_reference("gauge").expect("registered");

    let unknown = AttributeDescriptor::<i64>::new("voltage");
    assert_eq!(
        reference.get_attribute(&unknown).wait(),
        Err(AttributeError::Unknown {
            name: "voltage".into()
        })
    );
    // keys carry their type, so a well-behaved unit never sees the mistyped read
    let mistyped = AttributeDescriptor::<String>::new("count");
    assert!(matches!(
        reference.get_attribute(&mistyped).wait(),
        Err(AttributeError::Unknown { .. })
    ));

    system.shutdown();
    assert!(matches!(
        reference.get_attribute(&Gauge::COUNT).wait(),
        Err(AttributeError::Unavailable { .. })
    ));
}

/// Answers any attribute named `count` with an `i64`, whatever type was asked for.
struct LooseAnswers;

impl Unit for LooseAnswers {
    type Message = ();

    fn on_get_attribute(&self, key: &AttributeKey) -> Option<AttributeValue> {
        (key.name() == "count").then(|| Box::new(41_i64) as AttributeValue)
    }
}

#[test]
fn value_of_the_wrong_type_is_a_mismatch() {
    let mut builder = builder("attribute-mismatch", |c| c);
    builder.add("loose", LooseAnswers).expect("added");
    let system = builder.build().expect("Failed to build system");
    let reference = system.get_reference("loose").expect("registered");

    assert_eq!(
        reference
            .get_attribute(&AttributeDescriptor::<String>::new("count"))
            .wait(),
        Err(AttributeError::TypeMismatch {
            name: "count".into(),
            expected: std::any::type_name::<String>(),
        })
    );
    assert_eq!(
        reference
            .get_attribute(&AttributeDescriptor::<i64>::new("count"))
            .wait(),
        Ok(41)
    );
    system.shutdown();
}

/// Reports how many messages `peer` has received, read synchronously from
/// inside its own message handler.
struct Auditor;

impl Unit for Auditor {
    type Message = ();

    fn on_message(&self, ctx: &UnitContext<'_>, _: ()) -> Result<(), UnitError> {
        let peer = ctx.reference::<u8>("peer").ok_or("no peer")?;
        let seen = peer
            .get_attribute(&ProbeUnit::<u8>::RECEIVED_COUNT)
            .wait()?;
        ctx.reference::<usize>("report")
            .ok_or("no report")?
            .send_message(seen);
        Ok(())
    }
}

#[test]
fn units_can_wait_on_a_peer_attribute_while_handling_a_message() {
    let (peer, peer_probe) = ProbeUnit::<u8>::new();
    let (report, report_probe) = ProbeUnit::<usize>::new();
    let mut builder = builder("auditing", |c| c.add_integer(keys::SCHEDULER_POOL_SIZE, 1));
    builder
        .add("peer", peer)
        .and_then(|b| b.add("report", report))
        .and_then(|b| b.add("auditor", Auditor))
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let peer = system.reference::<u8>("peer").expect("registered");
    peer.send_message(1);
    peer.send_message(2);
    assert!(peer_probe.wait_for(2, WAIT));

    let auditor = system.reference::<()>("auditor").expect("registered");
    assert_eq!(auditor.delivery_policy(), DeliveryPolicy::System);
    auditor.send_message(());
    assert!(report_probe.wait_for(1, WAIT));
    assert_eq!(report_probe.received(), vec![2]);
    assert_eq!(auditor.failure_count(), 0);
    system.shutdown();
}

/// Critical unit on the general scheduler that takes its time over each message.
struct Plodder(Arc<AtomicUsize>);

impl Plodder {
    const PACE: Duration = Duration::from_millis(150);
}

impl Unit for Plodder {
    type Message = u32;
    const THREADING: ThreadingPolicy = ThreadingPolicy::Critical;

    fn on_message(&self, _ctx: &UnitContext<'_>, _: u32) -> Result<(), UnitError> {
        std::thread::sleep(Self::PACE);
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn busy_critical_unit_leaves_the_pool_to_other_units() {
    let handled = Arc::new(AtomicUsize::new(0));
    let (quick, quick_probe) = ProbeUnit::<u8>::new();
    let mut builder = builder("plodding", |c| c);
    builder
        .add("plodder", Plodder(handled.clone()))
        .and_then(|b| b.add("quick", quick))
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let plodder = system.reference::<u32>("plodder").expect("registered");
    for n in 0..6 {
        plodder.send_message(n);
    }
    std::thread::sleep(Duration::from_millis(20));

    system
        .reference::<u8>("quick")
        .expect("registered")
        .send_message(1);
    assert!(quick_probe.wait_for(1, Duration::from_millis(500)));
    assert!(
        handled.load(Ordering::SeqCst) < 6,
        "quick unit waited for the whole backlog"
    );
    assert!(quick_probe
        .threads()
        .iter()
        .all(|name| name.starts_with("robo-scheduler")));

    // queued critical messages still drain at shutdown
    system.shutdown();
    assert_eq!(handled.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn attribute_future_can_be_awaited() {
    let (probe_unit, _probe) = ProbeUnit::<u8>::new();
    let mut builder = builder("awaited", |c| c);
    builder.add("probe", probe_unit).expect("added");
    let system = builder.build().expect("Failed to build system");

    let reference = system.get_reference("probe").expect("registered");
    let count = reference
        .get_attribute(&ProbeUnit::<u8>::RECEIVED_COUNT)
        .await
        .expect("count");
    assert_eq!(count, 0);

    tokio::task::spawn_blocking(move || system.shutdown())
        .await
        .expect("shutdown task");
}

#[derive(Default)]
struct SerialState {
    active: AtomicUsize,
    max_active: AtomicUsize,
    handled: AtomicUsize,
}

/// Work-pool unit whose message bodies must never overlap.
struct Serial(Arc<SerialState>);

impl Unit for Serial {
    type Message = u32;
    const DELIVERY: DeliveryPolicy = DeliveryPolicy::Work;
    const THREADING: ThreadingPolicy = ThreadingPolicy::Critical;

    fn on_message(&self, _ctx: &UnitContext<'_>, _: u32) -> Result<(), UnitError> {
        let state = &self.0;
        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        state.active.fetch_sub(1, Ordering::SeqCst);
        state.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn critical_units_handle_one_message_at_a_time() {
    let serial = Arc::new(SerialState::default());
    let mut builder = builder("critical", |c| c);
    builder.add("serial", Serial(serial.clone())).expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let reference = system.reference::<u32>("serial").expect("registered");
    assert_eq!(reference.threading_policy(), ThreadingPolicy::Critical);

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let reference = reference.clone();
            std::thread::spawn(move || {
                for n in 0..10 {
                    reference.send_message(n);
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().expect("sender thread");
    }

    assert!(eventually(WAIT, || serial.handled.load(Ordering::SeqCst) == 40));
    assert_eq!(serial.max_active.load(Ordering::SeqCst), 1);
    system.shutdown();
}

#[test]
fn delivery_policy_selects_the_pool() {
    let (on_scheduler, scheduler_probe) = ProbeUnit::<u8>::new();
    let mut builder = builder("pools", |c| c);
    builder.add("default", on_scheduler).expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    system
        .reference::<u8>("default")
        .expect("registered")
        .send_message(1);
    assert!(scheduler_probe.wait_for(1, WAIT));
    assert!(scheduler_probe
        .threads()
        .iter()
        .all(|name| name.starts_with("robo-scheduler")));
    system.shutdown();
}

/// Forwards every message to the unit named by its `target` key.
struct Forwarder;

impl Unit for Forwarder {
    type Message = String;

    fn on_initialization(
        &self,
        _ctx: &UnitContext<'_>,
        config: &Configuration,
    ) -> Result<(), ConfigurationError> {
        config.require_string("target").map(|_| ())
    }

    fn on_message(&self, ctx: &UnitContext<'_>, message: String) -> Result<(), UnitError> {
        let target = ctx.configuration().get_string("target", "");
        let reference = ctx
            .reference::<String>(&target)
            .ok_or_else(|| format!("no unit {target}"))?;
        reference.send_message(format!("{} via {}", message, ctx.id()));
        Ok(())
    }
}

#[test]
fn units_reach_each_other_through_their_context() {
    let (sink, probe) = ProbeUnit::<String>::new();
    let mut builder = builder("forwarding", |c| c);
    builder
        .add("sink", sink)
        .and_then(|b| {
            b.add_configured(
                "forwarder",
                Forwarder,
                Configuration::builder().add_string("target", "sink").build(),
            )
        })
        .expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    system
        .reference::<String>("forwarder")
        .expect("registered")
        .send_message("ping".to_owned());
    assert!(probe.wait_for(1, WAIT));
    assert_eq!(probe.received(), vec!["ping via forwarder".to_owned()]);
    system.shutdown();
}

#[test]
fn scheduled_messages_stop_after_their_invocations() {
    let (ticker, probe) = ProbeUnit::<&'static str>::new();
    let mut builder = builder("scheduled", |c| c);
    builder.add("ticker", ticker).expect("added");
    let system = builder.build().expect("Failed to build system");
    system.start().expect("Failed to start system");

    let reference = system
        .reference::<&'static str>("ticker")
        .expect("registered");
    let (done_tx, done_rx) = mpsc::channel();
    let task = system.scheduler().schedule_message_with(
        &reference,
        "tick",
        Duration::ZERO,
        Duration::from_millis(5),
        Some(3),
        move || {
            let _ = done_tx.send(());
        },
    );

    assert!(done_rx.recv_timeout(WAIT).is_ok());
    assert!(probe.wait_for(3, WAIT));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(probe.received(), vec!["tick"; 3]);
    assert!(eventually(WAIT, || task.is_finished()));
    system.shutdown();
}

#[derive(Default)]
struct FlakyRelay {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MessageRelay for FlakyRelay {
    fn start(&self) -> Result<(), RelayError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Err(RelayError::Other("port already in use".into()))
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn failing_relay_does_not_block_start() {
    let relay = Arc::new(FlakyRelay::default());
    let (unit, probe) = ProbeUnit::<u8>::new();
    let mut builder = builder("relay", |c| c).with_relay(relay.clone());
    builder.add("unit", unit).expect("added");
    let system = builder.build().expect("Failed to build system");

    system.start().expect("Failed to start system");
    assert_eq!(probe.hook_count(robo_runtime::probe::Hook::Start), 1);
    assert!(eventually(WAIT, || relay.starts.load(Ordering::SeqCst) == 1));

    system.stop();
    assert_eq!(relay.stops.load(Ordering::SeqCst), 1);
    system.shutdown();
}

#[derive(Default)]
struct CountingEmitter {
    emits: AtomicUsize,
}

impl ContextEmitter for CountingEmitter {
    fn emit(&self) {
        self.emits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn emitter_runs_while_started() {
    let emitter = Arc::new(CountingEmitter::default());
    let mut builder = builder("emitter", |c| {
        c.add_child(
            keys::EMITTER,
            Configuration::builder().add_integer(keys::HEARTBEAT_INTERVAL_MS, 5),
        )
    })
    .with_emitter(emitter.clone());
    builder.add("unit", ProbeUnit::<u8>::new().0).expect("added");
    let system = builder.build().expect("Failed to build system");

    system.start().expect("Failed to start system");
    assert!(eventually(WAIT, || emitter.emits.load(Ordering::SeqCst) >= 3));

    system.stop();
    std::thread::sleep(Duration::from_millis(20));
    let after_stop = emitter.emits.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(emitter.emits.load(Ordering::SeqCst), after_stop);
    system.shutdown();
}

#[test]
fn emitter_can_be_disabled_by_configuration() {
    let emitter = Arc::new(CountingEmitter::default());
    let mut builder = builder("emitter-off", |c| {
        c.add_child(
            keys::EMITTER,
            Configuration::builder()
                .add_boolean(keys::ENABLED, false)
                .add_integer(keys::HEARTBEAT_INTERVAL_MS, 5),
        )
    })
    .with_emitter(emitter.clone());
    builder.add("unit", ProbeUnit::<u8>::new().0).expect("added");
    let system = builder.build().expect("Failed to build system");

    system.start().expect("Failed to start system");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(emitter.emits.load(Ordering::SeqCst), 0);
    system.shutdown();
}
