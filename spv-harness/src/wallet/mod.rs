//! SPV wallet instances: launch, secure channel, deterministic creation,
//! sync session, tip queries and cleanup.

pub mod rpc;
pub mod sync;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{HarnessConfig, WalletConfig};
use crate::convergence::TipSource;
use crate::error::{HarnessError, Result};
use crate::process::{
    allocate_local_addr, prepare_data_dir, ExternalProcessHandle, OsProcess, ProcessSpec,
    StopOutcome, TeardownReport,
};
use crate::tip::ChainTip;
use crate::tls::{read_tls_material, TlsPaths};

pub use rpc::WalletRpc;
pub use sync::SyncSession;

/// How long cleanup waits for the sync consumer after cancelling it.
const SESSION_SHUTDOWN_BOUND: Duration = Duration::from_secs(5);

/// One synced wallet and everything needed to query and tear it down.
pub struct WalletClient {
    name: String,
    data_dir: PathBuf,
    rpc: WalletRpc,
    session: SyncSession,
    /// `None` for wallets managed outside the harness.
    process: Option<Mutex<Box<dyn ExternalProcessHandle>>>,
    stop_grace: Duration,
}

impl std::fmt::Debug for WalletClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletClient")
            .field("name", &self.name)
            .field("data_dir", &self.data_dir)
            .field("synced", &self.session.is_synced())
            .field("managed", &self.process.is_some())
            .finish()
    }
}

impl WalletClient {
    /// Launch a wallet named `name` under the work directory and sync it
    /// against `peers`.
    ///
    /// Returns only after the wallet reported synced. Any failure stops the
    /// process before the error is returned.
    pub async fn start(config: &HarnessConfig, name: &str, peers: &[SocketAddr]) -> Result<Self> {
        let cfg = &config.wallet;
        let data_dir = config.work_dir.join(name);
        prepare_data_dir(&data_dir)?;
        let grpc_addr = allocate_local_addr().map_err(|e| {
            HarnessError::setup_io("unable to reserve gRPC port", &data_dir, e)
        })?;

        let spec = ProcessSpec {
            name: name.to_string(),
            program: cfg.binary.clone(),
            args: wallet_args(cfg, &data_dir, grpc_addr),
            log_file: data_dir.join("out.log"),
            data_dir: data_dir.clone(),
        };
        let mut process = OsProcess::start(&spec)?;

        match Self::connect(config, name, &data_dir, grpc_addr, peers).await {
            Ok(mut client) => {
                client.process = Some(Mutex::new(Box::new(process)));
                Ok(client)
            }
            Err(e) => {
                error!("{} failed to start: {} (logs in {})", name, e, data_dir.display());
                if let Err(stop_err) = process.stop(cfg.stop_grace).await {
                    error!("{} stop after failed start: {}", name, stop_err);
                }
                Err(e)
            }
        }
    }

    /// Bring up a wallet that is already listening on `grpc_addr`: wait for
    /// its certificate in `data_dir`, dial it over mutual TLS, create it and
    /// sync it against `peers`.
    ///
    /// The returned client does not own the wallet process.
    pub async fn connect(
        config: &HarnessConfig,
        name: &str,
        data_dir: &Path,
        grpc_addr: SocketAddr,
        peers: &[SocketAddr],
    ) -> Result<Self> {
        let cfg = &config.wallet;
        let paths = TlsPaths::in_dir(data_dir);
        let tls = read_tls_material(&paths, cfg.cert_interval, cfg.cert_timeout, data_dir).await?;
        let rpc = WalletRpc::connect_tls(
            grpc_addr,
            &tls,
            cfg.dial_backoff,
            cfg.dial_timeout,
            cfg.request_timeout,
            data_dir,
        )
        .await?;
        Self::attach(name, data_dir, rpc, peers, cfg).await
    }

    /// Bootstrap a wallet whose process is managed elsewhere: create it from
    /// the configured seed and sync it against `peers`.
    pub async fn attach(
        name: &str,
        data_dir: impl Into<PathBuf>,
        rpc: WalletRpc,
        peers: &[SocketAddr],
        cfg: &WalletConfig,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let session = bootstrap(name, &data_dir, &rpc, peers, cfg).await?;
        Ok(Self {
            name: name.to_string(),
            data_dir,
            rpc,
            session,
            process: None,
            stop_grace: cfg.stop_grace,
        })
    }

    /// Name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the wallet database, logs and certificate.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The open sync session.
    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// The wallet's current best (height, hash).
    pub async fn best_tip(&self) -> Result<ChainTip> {
        self.rpc
            .best_block()
            .await
            .map_err(|status| HarnessError::query(&self.name, status))
    }

    /// Cancel the sync session, then stop the process. Every step runs even
    /// when an earlier one failed.
    pub async fn cleanup(self) -> TeardownReport {
        let mut report = TeardownReport::new();
        report.record("cancel sync session", self.session.shutdown(SESSION_SHUTDOWN_BOUND).await);

        if let Some(process) = self.process {
            let mut process = process.into_inner();
            let stopped = match process.stop(self.stop_grace).await {
                Ok(StopOutcome::AlreadyExited(status)) if !status.success() => Err(
                    HarnessError::shutdown(&self.name, format!("exited early with {status}")),
                ),
                other => other.map(drop),
            };
            report.record(&format!("stop {}", self.name), stopped);
        }

        if report.is_clean() {
            info!("{} cleaned up", self.name);
        } else {
            error!("{} cleanup incomplete; inspect {}", self.name, self.data_dir.display());
        }
        report
    }
}

#[async_trait]
impl TipSource for WalletClient {
    fn label(&self) -> String {
        self.name.clone()
    }

    async fn best_tip(&self) -> Result<ChainTip> {
        WalletClient::best_tip(self).await
    }
}

// Create the wallet, open the sync session and wait for the synced milestone.
async fn bootstrap(
    name: &str,
    data_dir: &Path,
    rpc: &WalletRpc,
    peers: &[SocketAddr],
    cfg: &WalletConfig,
) -> Result<SyncSession> {
    let seed = cfg.seed()?;
    let passphrase = cfg.passphrase.as_bytes();
    rpc.create_wallet(&seed, passphrase, passphrase)
        .await
        .map_err(|status| {
            HarnessError::setup(format!("unable to create wallet {name}: {status}"), data_dir)
        })?;
    info!("{} created from fixed seed", name);

    let peers: Vec<String> = peers.iter().map(SocketAddr::to_string).collect();
    let mut session = SyncSession::start(
        name,
        data_dir,
        rpc.clone(),
        peers,
        passphrase.to_vec(),
        CancellationToken::new(),
    );
    if let Err(e) = session.wait_synced(cfg.sync_timeout).await {
        if let Err(stop_err) = session.shutdown(SESSION_SHUTDOWN_BOUND).await {
            error!("{}", stop_err);
        }
        return Err(e);
    }
    Ok(session)
}

fn wallet_args(cfg: &WalletConfig, data_dir: &Path, grpc: SocketAddr) -> Vec<String> {
    let cert = data_dir.join("rpc.cert");
    let mut args = vec![
        "--noinitialload".to_string(),
        format!("--debuglevel={}", cfg.debug_level),
        format!("--{}", cfg.network),
        "--nolegacyrpc".to_string(),
        format!("--grpclisten={grpc}"),
        format!("--appdata={}", data_dir.display()),
        format!("--tlscurve={}", cfg.tls_curve),
        format!("--rpccert={}", cert.display()),
        format!("--rpckey={}", data_dir.join("rpc.key").display()),
        // The wallet trusts its own certificate for client auth.
        format!("--clientcafile={}", cert.display()),
    ];
    args.extend(cfg.extra_args.iter().cloned());
    args
}
