//! Harness configuration.
//!
//! Every component receives its section of [`HarnessConfig`] at construction;
//! nothing reads paths, ports or binaries from ambient state. Defaults encode
//! the timeouts the harness documents. The one setting without a usable
//! default is the node's mining address, which is specific to the network
//! and must be supplied by TOML or `SPV_HARNESS_MINING_ADDR`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

const ALLOWED_DEBUG_LEVELS: [&str; 7] =
    ["trace", "debug", "info", "warn", "error", "critical", "off"];
const ALLOWED_TLS_CURVES: [&str; 4] = ["P-256", "P-384", "P-521", "Ed25519"];

/// Root configuration for a harness run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Parent of every per-process data directory.
    pub work_dir: PathBuf,
    /// Full-node processes.
    pub node: NodeConfig,
    /// The wallet process and its sync session.
    pub wallet: WalletConfig,
    /// Peer links and joins.
    pub topology: TopologyConfig,
    /// Wallet/node agreement polling.
    pub convergence: ConvergenceConfig,
    /// Built-in scenario knobs.
    pub scenario: ScenarioConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("spv-harness"),
            node: NodeConfig::default(),
            wallet: WalletConfig::default(),
            topology: TopologyConfig::default(),
            convergence: ConvergenceConfig::default(),
            scenario: ScenarioConfig::default(),
        }
    }
}

/// Full-node process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Node executable, resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// Network selector passed as `--<network>`.
    pub network: String,
    /// Node log verbosity.
    pub debug_level: String,
    /// RPC basic-auth user.
    pub rpc_user: String,
    /// RPC basic-auth password.
    pub rpc_pass: String,
    /// When false the node runs with `--notls` and RPC uses plain HTTP. The
    /// node only accepts that on loopback listeners, which is all the harness
    /// ever binds.
    pub rpc_tls: bool,
    /// Address credited by `generate`. The node refuses to mine without one,
    /// so launching a node requires it.
    pub mining_addr: Option<String>,
    /// Appended verbatim after the harness's own flags.
    pub extra_args: Vec<String>,
    /// How long a new node may take to answer RPC.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Readiness poll interval.
    #[serde(with = "humantime_serde")]
    pub ready_interval: Duration,
    /// Per-request RPC timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Wait after the interrupt before a forced kill.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("dcrd"),
            network: "simnet".into(),
            debug_level: "debug".into(),
            rpc_user: "user".into(),
            rpc_pass: "pass".into(),
            rpc_tls: false,
            mining_addr: None,
            extra_args: Vec::new(),
            ready_timeout: Duration::from_secs(30),
            ready_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(15),
        }
    }
}

impl NodeConfig {
    /// The configured mining address, or a config error naming how to set it.
    pub fn require_mining_addr(&self) -> Result<&str> {
        match self.mining_addr.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => Ok(addr),
            _ => Err(HarnessError::config(
                "node.mining_addr is required to mine; set it in the config file \
                 or through SPV_HARNESS_MINING_ADDR",
            )),
        }
    }
}

/// Wallet process and session settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalletConfig {
    /// Wallet executable, resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// Network selector passed as `--<network>`.
    pub network: String,
    /// Wallet log verbosity.
    pub debug_level: String,
    /// Curve of the self-signed gRPC certificate.
    pub tls_curve: String,
    /// Hex encoded wallet seed. Fixed so every run creates the same wallet.
    pub seed_hex: String,
    /// Used as both the public and the private passphrase.
    pub passphrase: String,
    /// Appended verbatim after the harness's own flags.
    pub extra_args: Vec<String>,
    /// How long the certificate may take to appear.
    #[serde(with = "humantime_serde")]
    pub cert_timeout: Duration,
    /// Certificate poll interval.
    #[serde(with = "humantime_serde")]
    pub cert_interval: Duration,
    /// How long the gRPC endpoint may take to accept a connection.
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    /// Pause between dial attempts.
    #[serde(with = "humantime_serde")]
    pub dial_backoff: Duration,
    /// Per-request gRPC timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long the wallet may take to report synced.
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// Wait after the interrupt before a forced kill.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("dcrwallet"),
            network: "simnet".into(),
            debug_level: "debug".into(),
            tls_curve: "P-256".into(),
            seed_hex: format!("{}ff", "00".repeat(31)),
            passphrase: "pass".into(),
            extra_args: Vec::new(),
            cert_timeout: Duration::from_secs(30),
            cert_interval: Duration::from_millis(100),
            dial_timeout: Duration::from_secs(30),
            dial_backoff: Duration::from_millis(20),
            request_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(15),
        }
    }
}

impl WalletConfig {
    /// Decoded wallet seed.
    pub fn seed(&self) -> Result<Vec<u8>> {
        hex::decode(&self.seed_hex)
            .map_err(|e| HarnessError::config(format!("invalid wallet seed_hex: {e}")))
    }
}

/// Peer link management and join polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologyConfig {
    /// How long a link may take to show up in, or vanish from, peer lists.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Peer list and tip poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long joined nodes may take to agree on a tip.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(60),
        }
    }
}

/// Wallet/node tip agreement polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Tip poll interval.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long wallet and node may take to agree.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Knobs of the built-in reorg scenarios.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Blocks the first node mines before the second one joins.
    pub premine_blocks: u32,
    /// Pause around topology changes so peers notice them.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Pause between single-block mining steps of long forks.
    #[serde(with = "humantime_serde")]
    pub block_interval: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            premine_blocks: 8,
            settle_delay: Duration::from_secs(1),
            block_interval: Duration::from_millis(10),
        }
    }
}

impl HarnessConfig {
    /// Default configuration rooted at `work_dir`.
    pub fn isolated(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a TOML file; missing keys keep their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let cfg = Self::parse_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with `SPV_HARNESS_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` if given, then apply environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::parse_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::config(format!("unable to read {}: {e}", path.display()))
        })?;
        toml::from_str(&data).map_err(|e| {
            HarnessError::config(format!("toml parse error in {}: {e}", path.display()))
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPV_HARNESS_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPV_HARNESS_NODE_BIN") {
            self.node.binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPV_HARNESS_WALLET_BIN") {
            self.wallet.binary = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPV_HARNESS_MINING_ADDR") {
            let v = v.trim();
            self.node.mining_addr = if v.is_empty() {
                None
            } else {
                Some(v.to_string())
            };
        }
    }

    /// Reject settings a run could not succeed with.
    pub fn validate(&self) -> Result<()> {
        let levels = [
            ("node", &self.node.debug_level),
            ("wallet", &self.wallet.debug_level),
        ];
        for (what, level) in levels {
            if !ALLOWED_DEBUG_LEVELS.contains(&level.as_str()) {
                return Err(HarnessError::config(format!("invalid {what} debug_level: {level}")));
            }
        }
        self.node.require_mining_addr()?;
        if !ALLOWED_TLS_CURVES.contains(&self.wallet.tls_curve.as_str()) {
            return Err(HarnessError::config(format!(
                "unsupported tls_curve: {}",
                self.wallet.tls_curve
            )));
        }
        let seed = self.wallet.seed()?;
        if !(16..=64).contains(&seed.len()) {
            return Err(HarnessError::config(format!(
                "wallet seed must be 16..=64 bytes, got {}",
                seed.len()
            )));
        }
        if self.wallet.passphrase.is_empty() {
            return Err(HarnessError::config("wallet passphrase must not be empty"));
        }
        check_poll("node ready", self.node.ready_interval, self.node.ready_timeout)?;
        check_poll("wallet certificate", self.wallet.cert_interval, self.wallet.cert_timeout)?;
        check_poll("wallet dial", self.wallet.dial_backoff, self.wallet.dial_timeout)?;
        check_poll("join", self.topology.poll_interval, self.topology.join_timeout)?;
        check_poll("connect", self.topology.poll_interval, self.topology.connect_timeout)?;
        check_poll("convergence", self.convergence.poll_interval, self.convergence.timeout)?;
        if self.scenario.premine_blocks == 0 {
            return Err(HarnessError::config("scenario premine_blocks must be at least 1"));
        }
        if self.wallet.sync_timeout.is_zero() {
            return Err(HarnessError::config("wallet sync_timeout must be non-zero"));
        }
        Ok(())
    }
}

fn check_poll(what: &str, interval: Duration, deadline: Duration) -> Result<()> {
    if interval.is_zero() || deadline.is_zero() {
        return Err(HarnessError::config(format!(
            "{what} interval and timeout must be non-zero"
        )));
    }
    if interval >= deadline {
        return Err(HarnessError::config(format!(
            "{what} interval {interval:?} must be shorter than its timeout {deadline:?}"
        )));
    }
    Ok(())
}
