//! Background consumer of the wallet's SPV sync stream.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::rpc::proto::SpvSyncResponse;
use super::rpc::WalletRpc;
use crate::error::{HarnessError, Result};

#[derive(Debug)]
enum Milestone {
    Pending(oneshot::Receiver<()>),
    Reached,
    Missed,
}

/// A running sync subscription and the one-shot "synced" milestone it
/// produces.
///
/// The stream stays open after the milestone; dropping it would stop the
/// wallet syncing. Only cancellation ends the consumer task, and dropping the
/// session cancels it.
#[derive(Debug)]
pub struct SyncSession {
    name: String,
    data_dir: PathBuf,
    cancel: CancellationToken,
    milestone: Milestone,
    task: JoinHandle<()>,
    _cancel_on_drop: DropGuard,
}

impl SyncSession {
    /// Spawn the consumer. The stream is opened inside the task, so this
    /// never blocks; failures to open it surface as a missed milestone.
    pub fn start(
        name: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        rpc: WalletRpc,
        peers: Vec<String>,
        private_passphrase: Vec<u8>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let (synced_tx, synced_rx) = oneshot::channel();
        let token = cancel.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("{} sync session cancelled", task_name),
                _ = consume(&task_name, rpc, peers, private_passphrase, synced_tx) => {}
            }
        });
        Self {
            name,
            data_dir: data_dir.into(),
            _cancel_on_drop: cancel.clone().drop_guard(),
            cancel,
            milestone: Milestone::Pending(synced_rx),
            task,
        }
    }

    /// Block until the wallet first reports synced, at most `timeout`.
    ///
    /// On timeout the session is cancelled. Returns immediately once the
    /// milestone has been observed by an earlier call.
    pub async fn wait_synced(&mut self, timeout: Duration) -> Result<()> {
        let rx = match std::mem::replace(&mut self.milestone, Milestone::Missed) {
            Milestone::Reached => {
                self.milestone = Milestone::Reached;
                return Ok(());
            }
            Milestone::Missed => return Err(self.sync_timeout(timeout)),
            Milestone::Pending(rx) => rx,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                self.milestone = Milestone::Reached;
                Ok(())
            }
            Ok(Err(_)) => {
                // The consumer is gone without ever seeing synced; nothing
                // can arrive any more.
                warn!("{} sync stream ended before the wallet synced", self.name);
                self.cancel();
                Err(self.sync_timeout(timeout))
            }
            Err(_) => {
                warn!("{} not synced after {:?}, cancelling session", self.name, timeout);
                self.cancel();
                Err(self.sync_timeout(timeout))
            }
        }
    }

    /// Whether [`wait_synced`](Self::wait_synced) has seen the milestone.
    pub fn is_synced(&self) -> bool {
        matches!(self.milestone, Milestone::Reached)
    }

    /// Ask the consumer to close the stream and exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the consumer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait up to `bound` for the consumer to exit, aborting it
    /// otherwise.
    pub async fn shutdown(self, bound: Duration) -> Result<()> {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(bound, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HarnessError::shutdown(format!("{} sync session", self.name), e)),
            Err(_) => {
                task.abort();
                Err(HarnessError::shutdown(
                    format!("{} sync session", self.name),
                    format!("consumer still running {bound:?} after cancel; aborted"),
                ))
            }
        }
    }

    fn sync_timeout(&self, timeout: Duration) -> HarnessError {
        HarnessError::SyncTimeout { timeout, data_dir: self.data_dir.clone() }
    }
}

async fn consume(
    name: &str,
    rpc: WalletRpc,
    peers: Vec<String>,
    private_passphrase: Vec<u8>,
    synced_tx: oneshot::Sender<()>,
) {
    let mut stream = match rpc.spv_sync(&peers, &private_passphrase).await {
        Ok(stream) => stream,
        Err(status) => {
            warn!("{} unable to open sync stream: {}", name, status);
            return;
        }
    };
    let mut synced_tx = Some(synced_tx);
    loop {
        match stream.message().await {
            Ok(Some(msg)) => {
                if msg.synced {
                    if let Some(tx) = synced_tx.take() {
                        info!("{} synced against {:?}", name, peers);
                        let _ = tx.send(());
                        continue;
                    }
                }
                debug!("{} sync progress: {}", name, describe(&msg));
            }
            Ok(None) => {
                debug!("{} sync stream closed", name);
                return;
            }
            // Cancellation shows up as an error here, so errors are not
            // reported further.
            Err(status) => {
                debug!("{} sync stream ended: {}", name, status);
                return;
            }
        }
    }
}

fn describe(msg: &SpvSyncResponse) -> String {
    match &msg.peer_information {
        Some(peer) => format!(
            "{:?} ({} peers, {})",
            msg.notification_type(),
            peer.peer_count,
            peer.address
        ),
        None => format!("{:?}", msg.notification_type()),
    }
}
