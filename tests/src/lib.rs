// Integration test support for the SPV reorg harness.
//
// Provides in-process fakes for the processes the harness normally drives:
// - fake_node: node JSON-RPC over axum, sharing one simulated chain network
// - fake_wallet: wallet gRPC over tonic, following its peers' best chain
// - launcher: hands the fakes to the built-in scenarios
// - tls_fixture: daemon-style self-signed certificates

use std::path::Path;
use std::time::Duration;

use spv_harness::HarnessConfig;

pub mod fake_node;
pub mod launcher;
pub mod tls_fixture;

pub use fake_node::{FakeNetwork, FakeNode};
pub use fake_wallet::{FakeWallet, SyncBehavior};
pub use launcher::FakeLauncher;
pub use tls_fixture::TlsFixture;

/// Test result type alias
pub type TestResult<T> = anyhow::Result<T>;

/// Harness configuration rooted at `dir` with timeouts sized for fakes.
pub fn test_config(dir: &Path) -> HarnessConfig {
    let mut cfg = HarnessConfig::isolated(dir);
    cfg.topology.connect_timeout = Duration::from_secs(2);
    cfg.topology.poll_interval = Duration::from_millis(20);
    cfg.topology.join_timeout = Duration::from_secs(2);
    cfg.convergence.poll_interval = Duration::from_millis(20);
    cfg.convergence.timeout = Duration::from_secs(2);
    cfg.wallet.request_timeout = Duration::from_secs(2);
    cfg.wallet.cert_interval = Duration::from_millis(20);
    cfg.wallet.cert_timeout = Duration::from_secs(2);
    cfg.wallet.dial_backoff = Duration::from_millis(20);
    cfg.wallet.dial_timeout = Duration::from_secs(2);
    cfg.wallet.sync_timeout = Duration::from_secs(2);
    cfg.wallet.stop_grace = Duration::from_millis(200);
    cfg.scenario.settle_delay = Duration::from_millis(20);
    cfg.scenario.block_interval = Duration::from_millis(1);
    cfg
}

pub fn init_tracing() {
    spv_harness::logging::init_test_tracing();
}
