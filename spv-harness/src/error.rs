//! Error types for the SPV harness.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::tip::ChainTip;

/// Result alias defaulting to [`HarnessError`].
pub type Result<T, E = HarnessError> = core::result::Result<T, E>;

/// Every failure the harness can report.
///
/// All variants except [`HarnessError::Shutdown`] and
/// [`HarnessError::Teardown`] abort the running scenario.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Process spawn, certificate read, channel dial or wallet creation failed.
    #[error("setup failed: {reason} (data dir: {})", .data_dir.display())]
    Setup {
        /// What went wrong, including the underlying cause.
        reason: String,
        /// Directory holding the failed process's files and logs.
        data_dir: PathBuf,
    },

    /// A node refused or botched a mining request.
    #[error("mining on {node} failed: {reason}")]
    Mining {
        /// Node asked to mine.
        node: String,
        /// Underlying cause.
        reason: String,
    },

    /// A tip or peer query failed.
    #[error("query to {target} failed: {reason}")]
    Query {
        /// Node or wallet queried.
        target: String,
        /// Underlying cause.
        reason: String,
    },

    /// A peer link could not be formed, dropped or confirmed.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Nodes kept disagreeing on their tip after a join.
    #[error("nodes did not agree on a tip within {timeout:?}; last seen: {last_seen}")]
    JoinTimeout {
        /// Budget that ran out.
        timeout: Duration,
        /// `label=tip` summary of the last poll.
        last_seen: String,
    },

    /// The wallet never reported synced.
    #[error("wallet did not report synced within {timeout:?} (data dir: {})", .data_dir.display())]
    SyncTimeout {
        /// Budget that ran out.
        timeout: Duration,
        /// The wallet's data directory.
        data_dir: PathBuf,
    },

    /// Wallet and node did not report the same tip in time.
    #[error(
        "{wallet} and {node} did not converge within {timeout:?}: wallet at {}, node at {}{}",
        display_tip(.wallet_tip),
        display_tip(.node_tip),
        display_last_error(.last_error)
    )]
    ConvergenceMismatch {
        /// Wallet label.
        wallet: String,
        /// Node label.
        node: String,
        /// Budget that ran out.
        timeout: Duration,
        /// Last tip the wallet reported, if any query succeeded.
        wallet_tip: Option<ChainTip>,
        /// Last tip the node reported, if any query succeeded.
        node_tip: Option<ChainTip>,
        /// Most recent query failure on either side.
        last_error: Option<String>,
    },

    /// A graceful stop failed or timed out. Never fatal on its own.
    #[error("shutdown of {name} failed: {reason}")]
    Shutdown {
        /// Process or session being stopped.
        name: String,
        /// Underlying cause.
        reason: String,
    },

    /// One or more teardown steps failed.
    #[error("teardown reported {} failure(s): {}", .0.len(), join_errors(.0))]
    Teardown(Vec<HarnessError>),

    /// Invalid or unreadable configuration.
    #[error("config: {0}")]
    Config(String),
}

impl HarnessError {
    /// A [`HarnessError::Setup`] for the process living in `data_dir`.
    pub fn setup(reason: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self::Setup {
            reason: reason.into(),
            data_dir: data_dir.into(),
        }
    }

    /// A [`HarnessError::Setup`] caused by a filesystem or socket error.
    pub fn setup_io(what: &str, data_dir: &Path, err: std::io::Error) -> Self {
        Self::setup(format!("{what}: {}", error_chain(&err)), data_dir)
    }

    /// A [`HarnessError::Mining`] on `node`.
    pub fn mining(node: impl Into<String>, reason: impl ToString) -> Self {
        Self::Mining {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// A [`HarnessError::Query`] against `target`.
    pub fn query(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Query {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// A [`HarnessError::Connectivity`].
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// A [`HarnessError::Shutdown`] of `name`.
    pub fn shutdown(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Shutdown {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// A [`HarnessError::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error should abort the current scenario.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Shutdown { .. } | Self::Teardown(_))
    }
}

/// `err` followed by each cause in its `source()` chain, `: ` separated.
///
/// Causes whose text already appears in the rendering are skipped, since
/// many errors print their source inline.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

fn display_tip(tip: &Option<ChainTip>) -> String {
    match tip {
        Some(tip) => tip.to_string(),
        None => "<never observed>".to_string(),
    }
}

fn display_last_error(err: &Option<String>) -> String {
    match err {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

fn join_errors(errors: &[HarnessError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
