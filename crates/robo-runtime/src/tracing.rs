//! # Logging
//!
//! The runtime logs through `tracing` with structured fields (`unit`, `system`,
//! `state`, `pool`). Lifecycle transitions of a system are `info`, per-unit hooks
//! `debug`, message flow and dropped messages `trace`, contained unit failures
//! `error`.
//!
//! ```bash
//! RUST_LOG=info cargo run -p robo-sample
//! RUST_LOG=robo_runtime=trace cargo run -p robo-sample
//! ```

use tracing_subscriber::EnvFilter;

/// Installs a compact `fmt` subscriber filtered by `RUST_LOG`.
///
/// Panics if a global subscriber is already installed.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}

/// Like [`setup_tracing`], but returns `false` instead of panicking when a
/// subscriber is already installed. Tests call this from every case.
pub fn try_setup_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init()
        .is_ok()
}
