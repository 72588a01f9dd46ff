#![forbid(unsafe_code)]

//! Harness that checks an SPV wallet keeps tracking full-node chain tips
//! while the node network is split, forked and rejoined.
//!
//! The pieces compose top-down:
//!
//! - [`ProcessHarness`] launches nodes, mines and reads tips.
//! - [`TopologyController`] links and unlinks nodes and waits for joins.
//! - [`WalletClient`] launches a wallet, creates it from a fixed seed and
//!   keeps a sync session open against chosen peers.
//! - [`ConvergenceChecker`] polls a wallet and a node until their tips match.
//! - [`Scenario`] drives all of the above through a fork and a rejoin, with
//!   processes supplied by a [`Launcher`].
//!
//! Every blocking step is bounded by a timeout from [`HarnessConfig`].

pub mod config;
pub mod convergence;
pub mod error;
pub mod logging;
pub mod node;
pub mod process;
pub mod retry;
pub mod scenario;
pub mod tip;
pub mod tls;
pub mod topology;
pub mod wallet;

pub use config::HarnessConfig;
pub use convergence::{await_agreement, ConvergenceChecker, TipSource};
pub use error::{HarnessError, Result};
pub use node::{NodeProcess, ProcessHarness};
pub use scenario::{Launcher, ProcessLauncher, Scenario};
pub use tip::ChainTip;
pub use topology::TopologyController;
pub use wallet::rpc::proto as walletrpc;
pub use wallet::{WalletClient, WalletRpc};
