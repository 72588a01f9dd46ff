//! Full-node processes: launch with an isolated data directory, wait for the
//! control endpoint, mine, query tips, stop.

pub mod rpc;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{HarnessConfig, NodeConfig};
use crate::convergence::TipSource;
use crate::error::{error_chain, HarnessError, Result};
use crate::process::{
    allocate_local_addr, prepare_data_dir, ExternalProcessHandle, OsProcess, ProcessSpec,
};
use crate::retry::retry_until;
use crate::tip::ChainTip;
use crate::tls::read_certificate;

pub use rpc::{AddNodeCommand, NodeRpc, PeerInfo, RpcEndpoint, RpcError};

/// A running full node and the addresses it listens on.
pub struct NodeProcess {
    name: String,
    data_dir: PathBuf,
    p2p_addr: SocketAddr,
    rpc: NodeRpc,
    /// `None` when the process is managed outside the harness.
    process: Option<Mutex<Box<dyn ExternalProcessHandle>>>,
    stop_grace: Duration,
}

impl std::fmt::Debug for NodeProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeProcess")
            .field("name", &self.name)
            .field("data_dir", &self.data_dir)
            .field("p2p_addr", &self.p2p_addr)
            .field("rpc", &self.rpc.url().as_str())
            .field("managed", &self.process.is_some())
            .finish()
    }
}

impl NodeProcess {
    /// Wrap a node whose process is managed elsewhere; teardown will only
    /// drop the RPC client.
    pub fn attach(
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        p2p_addr: SocketAddr,
        rpc: NodeRpc,
    ) -> Self {
        Self {
            name: name.into(),
            data_dir: data_dir.into(),
            p2p_addr,
            rpc,
            process: None,
            stop_grace: Duration::ZERO,
        }
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the node's chain data, logs and certificate.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Peer-to-peer listen address; what other nodes and wallets dial.
    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    /// JSON-RPC client for this node.
    pub fn rpc(&self) -> &NodeRpc {
        &self.rpc
    }

    /// Health check. Attached nodes are assumed alive.
    pub fn is_running(&mut self) -> bool {
        self.process
            .as_mut()
            .map_or(true, |p| p.get_mut().is_running())
    }

    /// Mine `count` blocks on top of the current tip and return the new tip.
    pub async fn generate(&self, count: u32) -> Result<ChainTip> {
        if count == 0 {
            return Err(HarnessError::mining(&self.name, "block count must be at least 1"));
        }
        let hashes = self
            .rpc
            .generate(count)
            .await
            .map_err(|e| HarnessError::mining(&self.name, error_chain(&e)))?;
        if hashes.len() != count as usize {
            return Err(HarnessError::mining(
                &self.name,
                format!("requested {count} blocks, node reported {}", hashes.len()),
            ));
        }
        let tip = self
            .rpc
            .best_block()
            .await
            .map_err(|e| HarnessError::mining(&self.name, error_chain(&e)))?;
        info!("{} mined {} block(s), tip now {}", self.name, count, tip);
        Ok(tip)
    }

    /// The node's current best (height, hash).
    pub async fn best_tip(&self) -> Result<ChainTip> {
        self.rpc
            .best_block()
            .await
            .map_err(|e| HarnessError::query(&self.name, error_chain(&e)))
    }

    async fn stop(self) -> Result<()> {
        match self.process {
            Some(process) => process.into_inner().stop(self.stop_grace).await.map(drop),
            None => {
                debug!("{} is externally managed; nothing to stop", self.name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TipSource for NodeProcess {
    fn label(&self) -> String {
        self.name.clone()
    }

    async fn best_tip(&self) -> Result<ChainTip> {
        NodeProcess::best_tip(self).await
    }
}

/// Factory and lifecycle owner for node processes.
///
/// Nodes are named `node1`, `node2`, ... in creation order and each gets
/// `<work_dir>/<name>` as its data directory.
pub struct ProcessHarness {
    work_dir: PathBuf,
    config: NodeConfig,
    created: AtomicU32,
}

impl ProcessHarness {
    /// Harness launching nodes under `config.work_dir`.
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            config: config.node.clone(),
            created: AtomicU32::new(0),
        }
    }

    /// Launch the next node and block until its control endpoint answers.
    pub async fn create(&self) -> Result<NodeProcess> {
        let index = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        self.create_named(&format!("node{index}")).await
    }

    /// Launch a node called `name` in `<work_dir>/<name>`.
    ///
    /// Refuses to start without a mining address, since such a node can
    /// never mine.
    pub async fn create_named(&self, name: &str) -> Result<NodeProcess> {
        let cfg = &self.config;
        cfg.require_mining_addr()?;
        let data_dir = self.work_dir.join(name);
        prepare_data_dir(&data_dir)?;

        let reserve = |what: &str| {
            allocate_local_addr().map_err(|e| {
                HarnessError::setup_io(&format!("unable to reserve {what} port"), &data_dir, e)
            })
        };
        let p2p_addr = reserve("p2p")?;
        let rpc_addr = reserve("rpc")?;
        let spec = ProcessSpec {
            name: name.to_string(),
            program: cfg.binary.clone(),
            args: node_args(cfg, &data_dir, p2p_addr, rpc_addr),
            log_file: data_dir.join("out.log"),
            data_dir: data_dir.clone(),
        };
        let mut process = OsProcess::start(&spec)?;

        let tls_cert = if cfg.rpc_tls {
            let cert_path = data_dir.join("rpc.cert");
            let cert =
                read_certificate(&cert_path, cfg.ready_interval, cfg.ready_timeout, &data_dir)
                    .await;
            match cert {
                Ok(cert) => Some(cert),
                Err(e) => return Err(abandon(process, e).await),
            }
        } else {
            None
        };

        let endpoint = RpcEndpoint {
            addr: rpc_addr,
            user: cfg.rpc_user.clone(),
            pass: cfg.rpc_pass.clone(),
            tls_cert,
            request_timeout: cfg.request_timeout,
        };
        let rpc = match NodeRpc::new(&endpoint) {
            Ok(rpc) => rpc,
            Err(e) => {
                let reason = format!("unable to build rpc client for {name}: {e}");
                return Err(abandon(process, HarnessError::setup(reason, &data_dir)).await);
            }
        };

        if let Err(e) = wait_ready(&rpc, cfg).await {
            let running = process.is_running();
            let reason = format!(
                "{name} control endpoint not responsive within {:?}{}: {e}",
                cfg.ready_timeout,
                if running { "" } else { " (process exited, see out.log)" }
            );
            return Err(abandon(process, HarnessError::setup(reason, &data_dir)).await);
        }

        info!("{} ready: p2p {}, rpc {}", name, p2p_addr, rpc.url());
        Ok(NodeProcess {
            name: name.to_string(),
            data_dir,
            p2p_addr,
            rpc,
            process: Some(Mutex::new(Box::new(process))),
            stop_grace: cfg.stop_grace,
        })
    }

    /// Mine `count` blocks on `node`.
    pub async fn generate_blocks(&self, node: &NodeProcess, count: u32) -> Result<ChainTip> {
        node.generate(count).await
    }

    /// Current tip of `node`.
    pub async fn best_tip(&self, node: &NodeProcess) -> Result<ChainTip> {
        node.best_tip().await
    }

    /// Stop the node gracefully, escalating to a kill after the grace period.
    pub async fn teardown(&self, node: NodeProcess) -> Result<()> {
        let name = node.name.clone();
        let result = node.stop().await;
        match &result {
            Ok(()) => info!("{} torn down", name),
            Err(e) => warn!("{} teardown: {}", name, e),
        }
        result
    }
}

async fn wait_ready(rpc: &NodeRpc, cfg: &NodeConfig) -> std::result::Result<ChainTip, String> {
    retry_until(cfg.ready_interval, cfg.ready_timeout, move || async move {
        rpc.best_block().await.map_err(|e| error_chain(&e))
    })
    .await
    .map_err(|e| e.last_error.unwrap_or_else(|| "request timed out".into()))
}

// Stop a process that failed to come up; the setup error is what matters.
async fn abandon(mut process: OsProcess, err: HarnessError) -> HarnessError {
    error!("{}: {}", process.name(), err);
    if let Err(stop_err) = process.stop(Duration::from_secs(2)).await {
        debug!("stopping failed node: {}", stop_err);
    }
    err
}

fn node_args(cfg: &NodeConfig, data_dir: &Path, p2p: SocketAddr, rpc: SocketAddr) -> Vec<String> {
    let mut args = vec![
        format!("--{}", cfg.network),
        format!("--datadir={}", data_dir.join("data").display()),
        format!("--logdir={}", data_dir.join("logs").display()),
        format!("--debuglevel={}", cfg.debug_level),
        format!("--listen={p2p}"),
        format!("--rpclisten={rpc}"),
        format!("--rpcuser={}", cfg.rpc_user),
        format!("--rpcpass={}", cfg.rpc_pass),
        format!("--rpccert={}", data_dir.join("rpc.cert").display()),
        format!("--rpckey={}", data_dir.join("rpc.key").display()),
    ];
    if !cfg.rpc_tls {
        args.push("--notls".into());
    }
    if let Some(addr) = &cfg.mining_addr {
        args.push(format!("--miningaddr={addr}"));
    }
    args.extend(cfg.extra_args.iter().cloned());
    args
}
