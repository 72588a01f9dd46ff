//! Peer links between nodes: forming and splitting the network, and waiting
//! for tips to propagate across it.

use std::time::Duration;

use tracing::{debug, info};

use crate::config::TopologyConfig;
use crate::convergence::{await_agreement, TipSource};
use crate::error::{HarnessError, Result};
use crate::node::{AddNodeCommand, NodeProcess};
use crate::retry::retry_until;
use crate::tip::ChainTip;

/// Connects, disconnects and joins node processes.
#[derive(Debug, Clone)]
pub struct TopologyController {
    connect_timeout: Duration,
    poll_interval: Duration,
    join_timeout: Duration,
}

impl TopologyController {
    /// Controller bounded by the timeouts in `cfg`.
    pub fn new(cfg: &TopologyConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout,
            poll_interval: cfg.poll_interval,
            join_timeout: cfg.join_timeout,
        }
    }

    /// Make `a` dial `b` and wait until the two are linked.
    ///
    /// A no-op when either side already dialed the other.
    pub async fn connect(&self, a: &NodeProcess, b: &NodeProcess) -> Result<()> {
        if link_between(a, b).await?.is_up() {
            debug!("{} already connected to {}", a.name(), b.name());
            return Ok(());
        }
        a.rpc()
            .add_node(b.p2p_addr(), AddNodeCommand::Add)
            .await
            .map_err(|e| {
                HarnessError::connectivity(format!("{} addnode {}: {e}", a.name(), b.name()))
            })?;

        self.wait_for_link(a, b, true).await?;
        info!("Connected {} -> {}", a.name(), b.name());
        Ok(())
    }

    /// Drop every connection between `a` and `b`, whichever side dialed,
    /// and wait until neither lists the other. Chains on either side may
    /// diverge afterwards.
    pub async fn disconnect(&self, a: &NodeProcess, b: &NodeProcess) -> Result<()> {
        // Fails when the link was never persistent; live connections are
        // dropped below either way.
        for (from, to) in [(a, b), (b, a)] {
            if let Err(e) = from.rpc().add_node(to.p2p_addr(), AddNodeCommand::Remove).await {
                debug!("{} addnode remove {}: {}", from.name(), to.name(), e);
            }
        }
        let link = link_between(a, b).await?;
        if link.a_to_b {
            drop_outbound(a, b).await?;
        }
        if link.b_to_a {
            drop_outbound(b, a).await?;
        }

        self.wait_for_link(a, b, false).await?;
        info!("Disconnected {} -x- {}", a.name(), b.name());
        Ok(())
    }

    /// Poll every node's tip until all report the same (height, hash).
    ///
    /// Connecting alone does not propagate blocks immediately; this is the
    /// wait that makes a join observable.
    pub async fn join_until_synced(&self, nodes: &[&NodeProcess]) -> Result<ChainTip> {
        if nodes.is_empty() {
            return Err(HarnessError::connectivity("join requires at least one node"));
        }
        let sources: Vec<&dyn TipSource> = nodes.iter().map(|n| *n as &dyn TipSource).collect();
        let tip = await_agreement(&sources, self.poll_interval, self.join_timeout)
            .await
            .map_err(|d| HarnessError::JoinTimeout {
                timeout: self.join_timeout,
                last_seen: d.summary(),
            })?;
        info!("Joined {} node(s) at {}", nodes.len(), tip);
        Ok(tip)
    }

    /// [`connect`](Self::connect) followed by
    /// [`join_until_synced`](Self::join_until_synced) on the pair.
    pub async fn connect_and_join(&self, a: &NodeProcess, b: &NodeProcess) -> Result<ChainTip> {
        self.connect(a, b).await?;
        self.join_until_synced(&[a, b]).await
    }

    async fn wait_for_link(&self, a: &NodeProcess, b: &NodeProcess, want_up: bool) -> Result<()> {
        let state = if want_up { "up" } else { "down" };
        retry_until(self.poll_interval, self.connect_timeout, move || async move {
            match link_between(a, b).await {
                Ok(link) if link.is_up() == want_up => Ok(()),
                Ok(link) => Err(format!("link still {link}")),
                Err(e) => Err(e.to_string()),
            }
        })
        .await
        .map_err(|e| {
            HarnessError::connectivity(format!(
                "link {} <-> {} not confirmed {state} within {:?}: {}",
                a.name(),
                b.name(),
                self.connect_timeout,
                e.last_error.unwrap_or_else(|| "peer query timed out".into())
            ))
        })
    }
}

/// Which directions of a node pair currently carry a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    a_to_b: bool,
    b_to_a: bool,
}

impl Link {
    fn is_up(self) -> bool {
        self.a_to_b || self.b_to_a
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.a_to_b, self.b_to_a) {
            (false, false) => f.write_str("down"),
            (true, false) => f.write_str("up (outbound)"),
            (false, true) => f.write_str("up (inbound)"),
            (true, true) => f.write_str("up (both directions)"),
        }
    }
}

async fn link_between(a: &NodeProcess, b: &NodeProcess) -> Result<Link> {
    let (a_to_b, b_to_a) = tokio::try_join!(dials(a, b), dials(b, a))?;
    Ok(Link { a_to_b, b_to_a })
}

/// Whether `from` holds an outbound connection to `to`.
///
/// Inbound entries carry the dialer's ephemeral port, so only the dialing
/// side can name the link by the remote's listen address.
async fn dials(from: &NodeProcess, to: &NodeProcess) -> Result<bool> {
    let target = to.p2p_addr().to_string();
    let peers = from.rpc().peers().await.map_err(|e| HarnessError::query(from.name(), e))?;
    Ok(peers.iter().any(|p| !p.inbound && p.addr == target))
}

async fn drop_outbound(from: &NodeProcess, to: &NodeProcess) -> Result<()> {
    from.rpc()
        .disconnect_peer(&to.p2p_addr().to_string())
        .await
        .map_err(|e| {
            HarnessError::connectivity(format!("{} disconnect {}: {e}", from.name(), to.name()))
        })
}
