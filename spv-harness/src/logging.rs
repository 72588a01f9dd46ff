//! `tracing` subscriber setup for the CLI and for tests.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honouring `RUST_LOG`, falling back to `level`.
///
/// Returns false when a global subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init().is_ok()
}

/// Test-friendly subscriber writing through the libtest capture. Safe to call
/// from every test.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
