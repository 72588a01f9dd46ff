//! End-to-end reorg scenarios driving node and wallet processes.
//!
//! Every scenario tears down all processes it started, whether or not its
//! body succeeded. A body failure wins over teardown failures. Processes
//! come from a [`Launcher`]; [`Scenario::run`] uses real binaries.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::HarnessConfig;
use crate::convergence::ConvergenceChecker;
use crate::error::{HarnessError, Result};
use crate::node::{NodeProcess, ProcessHarness};
use crate::process::TeardownReport;
use crate::topology::TopologyController;
use crate::wallet::WalletClient;

/// Blocks each side mines right after the split in the shallow reorg.
const SHALLOW_FORK: (u32, u32) = (2, 3);
/// First-round fork lengths in the multi-peer reorg.
const MULTI_PEER_FORK: (u32, u32) = (1, 2);
/// Second-round single-block extensions in the multi-peer reorg.
const MULTI_PEER_EXTENSION: (u32, u32) = (10, 12);
/// Extensions checked by the single-peer tracking scenario.
const TRACKING_STEPS: [u32; 3] = [1, 2, 5];

/// The built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Wallet on one node tracks each extension of that node.
    Tracking,
    /// Two nodes fork by 2 and 3 blocks; wallet follows node1, then the
    /// merged chain.
    Shallow,
    /// Wallet on both nodes follows whichever side is ahead through a deep
    /// fork.
    MultiPeer,
}

impl Scenario {
    /// Every scenario, in the order the CLI runs them.
    pub const ALL: [Scenario; 3] = [Scenario::Tracking, Scenario::Shallow, Scenario::MultiPeer];

    /// Name used on the command line and as the work subdirectory.
    pub fn name(self) -> &'static str {
        match self {
            Scenario::Tracking => "tracking",
            Scenario::Shallow => "shallow",
            Scenario::MultiPeer => "multi-peer",
        }
    }

    /// Run the scenario against real binaries in `config.work_dir/<name>`.
    pub async fn run(self, config: &HarnessConfig) -> Result<()> {
        let mut config = config.clone();
        config.work_dir = config.work_dir.join(self.name());
        let launcher = ProcessLauncher::new(&config);
        self.run_with(&config, &launcher).await
    }

    /// Run the scenario with processes from `launcher`.
    pub async fn run_with(self, config: &HarnessConfig, launcher: &dyn Launcher) -> Result<()> {
        info!("=== scenario {} ===", self.name());
        let result = match self {
            Scenario::Tracking => single_peer_tracking(config, launcher).await,
            Scenario::Shallow => shallow_reorg(config, launcher).await,
            Scenario::MultiPeer => multi_peer_reorg(config, launcher).await,
        };
        match &result {
            Ok(()) => info!("=== scenario {} passed ===", self.name()),
            Err(e) if e.is_fatal() => error!("=== scenario {} failed: {} ===", self.name(), e),
            Err(e) => warn!("=== scenario {} passed, teardown incomplete: {} ===", self.name(), e),
        }
        result
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| HarnessError::config(format!("unknown scenario: {s}")))
    }
}

/// Source of the nodes and wallet a scenario drives.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch the next node; it must answer RPC when returned.
    async fn launch_node(&self) -> Result<NodeProcess>;

    /// Launch wallet `name`, created and synced against `peers`.
    async fn launch_wallet(&self, name: &str, peers: &[SocketAddr]) -> Result<WalletClient>;

    /// Stop a node returned by [`launch_node`](Self::launch_node).
    async fn teardown_node(&self, node: NodeProcess) -> Result<()>;
}

/// Launches the configured node and wallet binaries.
pub struct ProcessLauncher {
    config: HarnessConfig,
    harness: ProcessHarness,
}

impl ProcessLauncher {
    /// Launcher placing every process under `config.work_dir`.
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            config: config.clone(),
            harness: ProcessHarness::new(config),
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch_node(&self) -> Result<NodeProcess> {
        self.harness.create().await
    }

    async fn launch_wallet(&self, name: &str, peers: &[SocketAddr]) -> Result<WalletClient> {
        WalletClient::start(&self.config, name, peers).await
    }

    async fn teardown_node(&self, node: NodeProcess) -> Result<()> {
        self.harness.teardown(node).await
    }
}

/// Processes owned by one scenario run.
struct Run<'a> {
    config: &'a HarnessConfig,
    launcher: &'a dyn Launcher,
    topology: TopologyController,
    checker: ConvergenceChecker,
    nodes: Vec<NodeProcess>,
    wallet: Option<WalletClient>,
}

impl<'a> Run<'a> {
    fn new(config: &'a HarnessConfig, launcher: &'a dyn Launcher) -> Self {
        Self {
            config,
            launcher,
            topology: TopologyController::new(&config.topology),
            checker: ConvergenceChecker::new(&config.convergence),
            nodes: Vec::new(),
            wallet: None,
        }
    }

    /// Launch another node; returns its index in `nodes`.
    async fn add_node(&mut self) -> Result<usize> {
        let node = self.launcher.launch_node().await?;
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    async fn start_wallet(&mut self, peers: &[usize]) -> Result<&WalletClient> {
        let addrs: Vec<_> = peers.iter().map(|&i| self.nodes[i].p2p_addr()).collect();
        let wallet = self.launcher.launch_wallet("wallet1", &addrs).await?;
        Ok(self.wallet.insert(wallet))
    }

    async fn settle(&self) {
        sleep(self.config.scenario.settle_delay).await;
    }

    /// Node1 mines the premine, node2 joins, node2 mines one more block.
    async fn shared_history(&mut self) -> Result<()> {
        let first = self.add_node().await?;
        self.nodes[first].generate(self.config.scenario.premine_blocks).await?;
        let second = self.add_node().await?;
        let (a, b) = (&self.nodes[first], &self.nodes[second]);

        self.topology.connect_and_join(a, b).await?;
        self.settle().await;
        b.generate(1).await?;
        self.settle().await;
        self.topology.join_until_synced(&[a, b]).await?;
        info!("Shared history ready");
        Ok(())
    }

    /// Mine `count` blocks one at a time with a short pause in between.
    async fn mine_singly(&self, node: &NodeProcess, count: u32) -> Result<()> {
        for _ in 0..count {
            node.generate(1).await?;
            sleep(self.config.scenario.block_interval).await;
        }
        Ok(())
    }

    async fn converge(&self, node: &NodeProcess) -> Result<()> {
        let Some(wallet) = &self.wallet else {
            return Err(HarnessError::config("no wallet started"));
        };
        self.checker.wait_for_convergence(wallet, node).await.map(drop)
    }

    /// Tear everything down and fold the outcome with the body result.
    async fn finish(self, outcome: Result<()>) -> Result<()> {
        if outcome.is_err() {
            let dirs = self
                .nodes
                .iter()
                .map(|n| n.data_dir())
                .chain(self.wallet.as_ref().map(|w| w.data_dir()))
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>();
            error!("Scenario failed; data directories for post-mortem: {}", dirs.join(", "));
        }

        let mut report = TeardownReport::new();
        if let Some(wallet) = self.wallet {
            report.merge(wallet.cleanup().await);
        }
        for node in self.nodes {
            let step = format!("teardown {}", node.name());
            report.record(&step, self.launcher.teardown_node(node).await);
        }

        outcome?;
        report.into_result()
    }
}

/// A wallet attached to a single node converges after every extension of
/// that node's chain.
pub async fn single_peer_tracking(config: &HarnessConfig, launcher: &dyn Launcher) -> Result<()> {
    let mut run = Run::new(config, launcher);
    let outcome = async {
        let node = run.add_node().await?;
        run.nodes[node].generate(config.scenario.premine_blocks).await?;
        run.start_wallet(&[node]).await?;
        run.converge(&run.nodes[node]).await?;

        for k in TRACKING_STEPS {
            run.nodes[node].generate(k).await?;
            run.converge(&run.nodes[node]).await?;
        }
        Ok::<_, HarnessError>(())
    }
    .await;
    run.finish(outcome).await
}

/// Split two joined nodes, mine 2 and 3 blocks, check the wallet on node1
/// stays with node1, then rejoin and check everyone lands on one tip.
pub async fn shallow_reorg(config: &HarnessConfig, launcher: &dyn Launcher) -> Result<()> {
    let mut run = Run::new(config, launcher);
    let outcome = async {
        run.shared_history().await?;
        run.start_wallet(&[0]).await?;
        let (a, b) = (&run.nodes[0], &run.nodes[1]);
        run.converge(a).await?;
        run.converge(b).await?;
        info!("Wallet created and synced");

        run.topology.disconnect(a, b).await?;
        a.generate(SHALLOW_FORK.0).await?;
        b.generate(SHALLOW_FORK.1).await?;
        run.converge(a).await?;

        run.topology.connect_and_join(a, b).await?;
        info!("Reorg caused");
        run.converge(a).await?;
        run.converge(b).await
    }
    .await;
    run.finish(outcome).await
}

/// Wallet synced against both nodes follows whichever side is checked
/// through a 1-vs-2 fork, then a 10-vs-12 extension.
pub async fn multi_peer_reorg(config: &HarnessConfig, launcher: &dyn Launcher) -> Result<()> {
    let mut run = Run::new(config, launcher);
    let outcome = async {
        run.shared_history().await?;
        run.start_wallet(&[0, 1]).await?;
        let (a, b) = (&run.nodes[0], &run.nodes[1]);
        run.converge(a).await?;
        run.converge(b).await?;
        info!("Wallet created and synced");

        run.topology.disconnect(a, b).await?;
        run.settle().await;

        a.generate(MULTI_PEER_FORK.0).await?;
        run.converge(a).await?;
        b.generate(MULTI_PEER_FORK.1).await?;
        run.converge(b).await?;
        run.settle().await;

        run.mine_singly(a, MULTI_PEER_EXTENSION.0).await?;
        run.converge(a).await?;
        run.settle().await;

        run.mine_singly(b, MULTI_PEER_EXTENSION.1).await?;
        run.converge(b).await
    }
    .await;
    run.finish(outcome).await
}
