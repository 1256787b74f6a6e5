//! Shared helpers for replog-core integration tests.
//!
//! Each test binary pulls this in with `mod common;`.

use tracing_subscriber::EnvFilter;

/// Route tracing output through the test harness.
///
/// Honors `RUST_LOG`; defaults to `replog_core=debug`. Safe to call from
/// every test.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("replog_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
