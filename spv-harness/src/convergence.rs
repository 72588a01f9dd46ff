//! Bounded polling until independent parties report the same chain tip.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::ConvergenceConfig;
use crate::error::{HarnessError, Result};
use crate::retry::retry_until;
use crate::tip::ChainTip;

/// Anything that can report its current best tip.
#[async_trait]
pub trait TipSource: Send + Sync {
    /// Name used in logs and errors.
    fn label(&self) -> String;

    /// Current best (height, hash).
    async fn best_tip(&self) -> Result<ChainTip>;
}

/// What was last seen when sources failed to agree in time.
#[derive(Debug, Clone)]
pub struct Disagreement {
    /// Last successfully observed tip per source, in input order.
    pub tips: Vec<(String, Option<ChainTip>)>,
    /// Most recent query failure, if any poll failed.
    pub last_error: Option<String>,
    /// How long polling ran before giving up.
    pub elapsed: Duration,
}

impl Disagreement {
    /// One-line `label=tip` summary.
    pub fn summary(&self) -> String {
        let mut out = self
            .tips
            .iter()
            .map(|(label, tip)| match tip {
                Some(tip) => format!("{label}={tip}"),
                None => format!("{label}=<never observed>"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Some(err) = &self.last_error {
            out.push_str(&format!(" (last error: {err})"));
        }
        out
    }
}

#[derive(Default)]
struct Observed {
    tips: Vec<Option<ChainTip>>,
    last_error: Option<String>,
}

/// Poll all `sources` every `interval` until they report one identical tip.
///
/// All sources are queried concurrently each round and agreement is only
/// declared when every query of that round succeeded and the (height, hash)
/// pairs are equal. Tips from earlier rounds never count towards agreement.
pub async fn await_agreement(
    sources: &[&dyn TipSource],
    interval: Duration,
    deadline: Duration,
) -> std::result::Result<ChainTip, Disagreement> {
    let observed = &Mutex::new(Observed {
        tips: vec![None; sources.len()],
        last_error: None,
    });

    let outcome = retry_until(interval, deadline, move || async move {
        let results = join_all(sources.iter().map(|s| s.best_tip())).await;
        let mut guard = observed.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = &mut *guard;

        let mut round = Vec::with_capacity(results.len());
        let mut failed = false;
        for (slot, result) in seen.tips.iter_mut().zip(results) {
            match result {
                Ok(tip) => {
                    *slot = Some(tip);
                    round.push(tip);
                }
                Err(e) => {
                    debug!("tip query failed: {}", e);
                    seen.last_error = Some(e.to_string());
                    failed = true;
                }
            }
        }
        match round.split_first() {
            Some((first, rest)) if !failed && rest.iter().all(|t| t == first) => Ok(*first),
            _ => Err(()),
        }
    })
    .await;

    outcome.map_err(|exhausted| {
        let seen = observed.lock().unwrap_or_else(PoisonError::into_inner);
        Disagreement {
            tips: sources.iter().map(|s| s.label()).zip(seen.tips.iter().copied()).collect(),
            last_error: seen.last_error.clone(),
            elapsed: exhausted.elapsed,
        }
    })
}

/// Asserts that a wallet and a node agree on the chain tip.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceChecker {
    poll_interval: Duration,
    timeout: Duration,
}

impl ConvergenceChecker {
    /// Checker polling at `cfg.poll_interval` for up to `cfg.timeout`.
    pub fn new(cfg: &ConvergenceConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval,
            timeout: cfg.timeout,
        }
    }

    /// Wait up to the configured timeout for `wallet` and `node` to agree.
    pub async fn wait_for_convergence(
        &self,
        wallet: &dyn TipSource,
        node: &dyn TipSource,
    ) -> Result<ChainTip> {
        self.wait_for_convergence_within(wallet, node, self.timeout).await
    }

    /// Succeeds the first time both report an identical (height, hash) pair;
    /// fails with `ConvergenceMismatch` carrying the last values of both sides.
    pub async fn wait_for_convergence_within(
        &self,
        wallet: &dyn TipSource,
        node: &dyn TipSource,
        timeout: Duration,
    ) -> Result<ChainTip> {
        let interval = self.poll_interval.min(timeout);
        match await_agreement(&[wallet, node], interval, timeout).await {
            Ok(tip) => {
                info!("{} converged with {} at {}", wallet.label(), node.label(), tip);
                Ok(tip)
            }
            Err(mut d) => {
                warn!("No convergence after {:?}: {}", d.elapsed, d.summary());
                let node_tip = d.tips.pop().and_then(|(_, t)| t);
                let wallet_tip = d.tips.pop().and_then(|(_, t)| t);
                Err(HarnessError::ConvergenceMismatch {
                    wallet: wallet.label(),
                    node: node.label(),
                    timeout,
                    wallet_tip,
                    node_tip,
                    last_error: d.last_error,
                })
            }
        }
    }
}
