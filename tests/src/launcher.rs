// Scenario launcher backed by the in-process fakes.
//
// Nodes are fake JSON-RPC servers on one FakeNetwork. The wallet is a fake
// gRPC server behind TLS whose certificate shows up in its data directory
// shortly after it starts listening, and the harness brings it up through
// the same certificate wait and TLS dial it uses for a real wallet.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use spv_harness::error::{HarnessError, Result};
use spv_harness::retry::retry_until;
use spv_harness::{HarnessConfig, Launcher, NodeProcess, WalletClient};

use crate::{FakeNetwork, FakeNode, FakeWallet, SyncBehavior, TlsFixture};

/// How long the fake wallet listens before its certificate appears.
const CERT_DELAY: Duration = Duration::from_millis(50);
const STREAM_POLL: Duration = Duration::from_millis(10);
const STREAM_DRAIN: Duration = Duration::from_secs(1);

/// [`Launcher`] handing out fakes; remembers what it launched and tore down.
pub struct FakeLauncher {
    network: FakeNetwork,
    config: HarnessConfig,
    behavior: SyncBehavior,
    nodes: Mutex<Vec<FakeNode>>,
    wallets: Mutex<Vec<FakeWallet>>,
    events: Mutex<Vec<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeLauncher {
    pub fn new(config: &HarnessConfig, behavior: SyncBehavior) -> Self {
        Self {
            network: FakeNetwork::new(),
            config: config.clone(),
            behavior,
            nodes: Mutex::new(Vec::new()),
            wallets: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Launch and teardown steps in the order they happened.
    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    /// Fake nodes still serving RPC.
    pub fn running_nodes(&self) -> usize {
        lock(&self.nodes).len()
    }

    fn record(&self, event: String) {
        debug!("launcher: {}", event);
        lock(&self.events).push(event);
    }

    fn open_wallet_streams(&self) -> usize {
        lock(&self.wallets).iter().map(FakeWallet::open_streams).sum()
    }

    fn data_dir(&self, name: &str) -> PathBuf {
        self.config.work_dir.join(name)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch_node(&self) -> Result<NodeProcess> {
        let name = format!("node{}", lock(&self.nodes).len() + 1);
        let setup = |e: anyhow::Error| {
            HarnessError::setup(format!("fake {name}: {e:#}"), self.data_dir(&name))
        };
        let fake = self.network.spawn_node().await.map_err(setup)?;
        let node = fake.attach(&name, &self.config.work_dir).map_err(setup)?;
        lock(&self.nodes).push(fake);
        self.record(format!("launch {name}"));
        Ok(node)
    }

    async fn launch_wallet(&self, name: &str, peers: &[SocketAddr]) -> Result<WalletClient> {
        let data_dir = self.data_dir(name);
        let setup = |e: anyhow::Error| {
            HarnessError::setup(format!("fake {name}: {e:#}"), &data_dir)
        };
        let identity = TlsFixture::ca_flagged().map_err(setup)?;
        let wallet = FakeWallet::spawn_tls(&self.network, self.behavior, &identity)
            .await
            .map_err(setup)?;
        let addr = wallet.addr;
        lock(&self.wallets).push(wallet);

        let cert_dir = data_dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CERT_DELAY).await;
            if let Err(e) = identity.write_to(&cert_dir).await {
                debug!("writing fake wallet certificate: {:#}", e);
            }
        });

        self.record(format!("launch {name}"));
        WalletClient::connect(&self.config, name, &data_dir, addr, peers).await
    }

    async fn teardown_node(&self, node: NodeProcess) -> Result<()> {
        let mut fake = {
            let mut nodes = lock(&self.nodes);
            let index = nodes
                .iter()
                .position(|fake| fake.p2p_addr == node.p2p_addr())
                .ok_or_else(|| HarnessError::shutdown(node.name(), "not launched here"))?;
            nodes.remove(index)
        };
        fake.stop();

        // A cancelled stream closes on the server a moment after the client
        // drops it.
        let streams = retry_until(STREAM_POLL, STREAM_DRAIN, || async {
            match self.open_wallet_streams() {
                0 => Ok(0),
                open => Err(open),
            }
        })
        .await
        .unwrap_or_else(|e| e.last_error.unwrap_or_default());
        self.record(format!("teardown {} (open wallet streams: {streams})", node.name()));
        Ok(())
    }
}
