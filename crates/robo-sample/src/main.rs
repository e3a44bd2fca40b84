//! # Robo Sample Launcher
//!
//! Builds the demo system from the sample units, starts it and runs until Ctrl-C or
//! a line on stdin, then shuts the system down.
//!
//! ```bash
//! RUST_LOG=info cargo run -p robo-sample
//! RUST_LOG=debug cargo run -p robo-sample -- --interval-ms 200 --messages 5
//! ```
//!
//! `--force-exit-after-ms` bounds how long shutdown may take before the process
//! exits anyway.

use std::time::Duration;

use clap::Parser;
use robo_runtime::system::keys;
use robo_runtime::tracing::setup_tracing;
use robo_runtime::Configuration;
use robo_sample::counter_unit::CounterUnit;
use robo_sample::lifecycle::{DemoError, DemoSettings, DemoSystem};
use robo_sample::string_units::StringConsumer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// Runs the robo sample units in one local system.
#[derive(Parser, Debug)]
#[command(name = "robo-sample")]
#[command(version, about, long_about = None)]
struct Args {
    /// System id (defaults to a random UUID)
    #[arg(long)]
    uid: Option<String>,

    /// Milliseconds between counter updates
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Strings the producer sends after start
    #[arg(long, default_value_t = 10)]
    messages: u64,

    /// Milliseconds between producer strings
    #[arg(long, default_value_t = 500)]
    message_period_ms: u64,

    /// Threads of the general scheduler
    #[arg(long)]
    scheduler_threads: Option<i64>,

    /// Threads of the work pool
    #[arg(long)]
    worker_threads: Option<i64>,

    /// Threads of the blocking pool
    #[arg(long)]
    blocking_threads: Option<i64>,

    /// How long the system waits for its pools to drain at shutdown
    #[arg(long)]
    shutdown_timeout_ms: Option<i64>,

    /// Exit the process this many milliseconds after shutdown was requested, even if
    /// the system has not finished shutting down
    #[arg(long, value_name = "MS")]
    force_exit_after_ms: Option<u64>,
}

impl Args {
    fn settings(&self) -> DemoSettings {
        let runtime = [
            (keys::SCHEDULER_POOL_SIZE, self.scheduler_threads),
            (keys::WORKER_POOL_SIZE, self.worker_threads),
            (keys::BLOCKING_POOL_SIZE, self.blocking_threads),
            (keys::SHUTDOWN_TIMEOUT_MS, self.shutdown_timeout_ms),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key, value)))
        .fold(Configuration::builder(), |builder, (key, value)| {
            builder.add_integer(key, value)
        })
        .build();

        DemoSettings {
            uid: self.uid.clone(),
            runtime,
            counter_interval: Duration::from_millis(self.interval_ms),
            messages: self.messages,
            message_period: Duration::from_millis(self.message_period_ms),
        }
    }
}

async fn wait_for_exit_request() {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Interrupted");
        }
        _ = stdin.next_line() => info!("Input received"),
    }
}

async fn report(demo: &DemoSystem) {
    match demo.consumer().get_attribute(&StringConsumer::TOTAL_MESSAGES).await {
        Ok(total) => info!(total, "Consumer totals"),
        Err(e) => warn!(error = %e, "Could not read consumer totals"),
    }
    match demo.counter().get_attribute(&CounterUnit::COUNTER).await {
        Ok(counter) => info!(counter, "Counter value"),
        Err(e) => warn!(error = %e, "Could not read counter"),
    }
}

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    setup_tracing();
    let args = Args::parse();

    let demo = DemoSystem::new(&args.settings())?;
    info!(system = %demo.system(), "Demo system built");
    demo.start()?;
    info!("Press Ctrl-C or Enter to shut down");

    wait_for_exit_request().await;
    report(&demo).await;

    if let Some(delay) = args.force_exit_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            warn!(delay_ms = delay, "Shutdown took too long, forcing exit");
            std::process::exit(1);
        });
    }

    // System shutdown blocks while the pools drain.
    match tokio::task::spawn_blocking(move || demo.shutdown()).await {
        Ok(()) => info!("Demo system shut down"),
        Err(e) => error!(error = %e, "Shutdown task failed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_flags_become_runtime_configuration() {
        let args = Args::parse_from([
            "robo-sample",
            "--worker-threads",
            "3",
            "--shutdown-timeout-ms",
            "250",
        ]);
        let settings = args.settings();
        assert_eq!(settings.runtime.get_integer(keys::WORKER_POOL_SIZE, 0), 3);
        assert_eq!(settings.runtime.get_integer(keys::SHUTDOWN_TIMEOUT_MS, 0), 250);
        assert!(!settings.runtime.contains(keys::SCHEDULER_POOL_SIZE));
        assert_eq!(settings.counter_interval, Duration::from_secs(1));
    }

    #[test]
    fn force_exit_is_optional() {
        let args = Args::parse_from(["robo-sample", "--force-exit-after-ms", "100"]);
        assert_eq!(args.force_exit_after_ms, Some(100));
        assert_eq!(Args::parse_from(["robo-sample"]).force_exit_after_ms, None);
    }
}
