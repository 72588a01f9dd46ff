// End-to-end reorg scenarios against real node and wallet binaries.
//
// Binaries default to `dcrd` and `dcrwallet` on PATH; point
// SPV_HARNESS_NODE_BIN and SPV_HARNESS_WALLET_BIN elsewhere to override.
// SPV_HARNESS_MINING_ADDR must hold a simnet address for the nodes to mine.

use spv_harness::{HarnessConfig, Scenario};
use spv_integration_tests::{init_tracing, TestResult};

fn config(dir: &std::path::Path) -> TestResult<HarnessConfig> {
    let mut cfg = HarnessConfig::from_env()?;
    cfg.work_dir = dir.to_path_buf();
    Ok(cfg)
}

#[tokio::test]
#[ignore] // Requires dcrd and dcrwallet on PATH
async fn single_peer_tracking() -> TestResult<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    Scenario::Tracking.run(&config(dir.path())?).await?;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires dcrd and dcrwallet on PATH
async fn shallow_reorg() -> TestResult<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    Scenario::Shallow.run(&config(dir.path())?).await?;
    Ok(())
}

#[tokio::test]
#[ignore] // Requires dcrd and dcrwallet on PATH
async fn multi_peer_reorg() -> TestResult<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    Scenario::MultiPeer.run(&config(dir.path())?).await?;
    Ok(())
}
