#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use spv_harness::{HarnessConfig, Scenario};

#[derive(Debug, Parser)]
#[command(
    name = "spv-reorg",
    version,
    about = "Run SPV wallet reorg scenarios against dcrd and dcrwallet"
)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Override the work directory holding every process data dir
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Scenario to run
    #[arg(value_enum, default_value_t = Which::All)]
    scenario: Which,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Which {
    Tracking,
    Shallow,
    MultiPeer,
    All,
}

impl Which {
    fn scenarios(self) -> Vec<Scenario> {
        match self {
            Which::Tracking => vec![Scenario::Tracking],
            Which::Shallow => vec![Scenario::Shallow],
            Which::MultiPeer => vec![Scenario::MultiPeer],
            Which::All => Scenario::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    spv_harness::logging::init(&cli.log_level);

    let mut config =
        HarnessConfig::load(cli.config.as_deref()).context("loading harness configuration")?;
    if let Some(dir) = cli.work_dir {
        config.work_dir = dir;
    }
    info!("Work directory: {}", config.work_dir.display());

    let mut failed = Vec::new();
    for scenario in cli.scenario.scenarios() {
        if let Err(e) = scenario.run(&config).await {
            error!("{} failed: {}", scenario, e);
            failed.push(scenario.name());
        }
    }

    if failed.is_empty() {
        info!("All scenarios passed");
        Ok(())
    } else {
        anyhow::bail!("failed scenarios: {}", failed.join(", "))
    }
}
