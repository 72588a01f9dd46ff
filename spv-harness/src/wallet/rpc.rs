//! gRPC client for the wallet's loader and wallet services.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Status, Streaming};
use tracing::{debug, info};

use crate::error::{error_chain, HarnessError, Result};
use crate::retry::retry_until;
use crate::tip::ChainTip;
use crate::tls::TlsMaterial;

/// Generated wallet API types, clients and server traits.
#[allow(missing_docs, clippy::all)]
pub mod proto {
    tonic::include_proto!("walletrpc");
}

use proto::wallet_loader_service_client::WalletLoaderServiceClient;
use proto::wallet_service_client::WalletServiceClient;
use proto::{BestBlockRequest, CreateWalletRequest, SpvSyncRequest, SpvSyncResponse};

/// Name the wallet's self-signed certificate is issued for.
pub const TLS_DOMAIN: &str = "localhost";

/// Upper bound for a single TCP connect plus TLS handshake while dialing.
const ATTEMPT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connected wallet RPC clients sharing one channel.
#[derive(Debug, Clone)]
pub struct WalletRpc {
    loader: WalletLoaderServiceClient<Channel>,
    wallet: WalletServiceClient<Channel>,
    request_timeout: Duration,
}

impl WalletRpc {
    /// Clients over an already established channel. Unary calls are cut off
    /// after `request_timeout`.
    pub fn from_channel(channel: Channel, request_timeout: Duration) -> Self {
        Self {
            loader: WalletLoaderServiceClient::new(channel.clone()),
            wallet: WalletServiceClient::new(channel),
            request_timeout,
        }
    }

    /// Dial `addr` over mutual TLS, retrying every `backoff` until
    /// `dial_timeout` passes.
    ///
    /// The server must present exactly the certificate in `tls`.
    pub async fn connect_tls(
        addr: SocketAddr,
        tls: &TlsMaterial,
        backoff: Duration,
        dial_timeout: Duration,
        request_timeout: Duration,
        data_dir: &Path,
    ) -> Result<Self> {
        let config = tls.client_config().map_err(|e| {
            HarnessError::setup(format!("invalid wallet TLS material: {e}"), data_dir)
        })?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(TLS_DOMAIN)
            .map_err(|e| HarnessError::setup(format!("invalid TLS domain: {e}"), data_dir))?
            .to_owned();
        // The connector does TLS, so the channel itself speaks plain h2.
        let endpoint = Endpoint::from_shared(format!("http://{addr}")).map_err(|e| {
            HarnessError::setup(format!("invalid wallet endpoint {addr}: {e}"), data_dir)
        })?;
        let attempt_timeout = ATTEMPT_CONNECT_TIMEOUT.min(dial_timeout);

        let (endpoint, connector, server_name) = (&endpoint, &connector, &server_name);
        let channel = retry_until(backoff, dial_timeout, move || async move {
            let (connector, server_name) = (connector.clone(), server_name.clone());
            let dial = tower::service_fn(move |_: Uri| {
                handshake(addr, connector.clone(), server_name.clone(), attempt_timeout)
            });
            endpoint.connect_with_connector(dial).await.map_err(|e| {
                let reason = error_chain(&e);
                debug!("dial {} failed: {}", addr, reason);
                reason
            })
        })
        .await
        .map_err(|e| {
            HarnessError::setup(
                format!(
                    "unable to dial wallet at {addr} after {} attempts: {}",
                    e.attempts,
                    e.last_error.unwrap_or_else(|| "dial timed out".into())
                ),
                data_dir,
            )
        })?;

        info!("Connected to wallet gRPC at {}", addr);
        Ok(Self::from_channel(channel, request_timeout))
    }

    /// Create a wallet from a fixed seed so every run derives the same keys.
    pub async fn create_wallet(
        &self,
        seed: &[u8],
        public_passphrase: &[u8],
        private_passphrase: &[u8],
    ) -> Result<(), Status> {
        let request = CreateWalletRequest {
            public_passphrase: public_passphrase.to_vec(),
            private_passphrase: private_passphrase.to_vec(),
            seed: seed.to_vec(),
        };
        let mut loader = self.loader.clone();
        self.bounded(async move { loader.create_wallet(request).await })
            .await
            .map(drop)
    }

    /// Open the SPV sync stream against `peers` with account discovery on.
    ///
    /// Not bounded by the request timeout: the wallet may hold response
    /// headers back until it has something to report.
    pub async fn spv_sync(
        &self,
        peers: &[String],
        private_passphrase: &[u8],
    ) -> Result<Streaming<SpvSyncResponse>, Status> {
        let request = SpvSyncRequest {
            discover_accounts: true,
            private_passphrase: private_passphrase.to_vec(),
            spv_connect: peers.to_vec(),
        };
        let mut loader = self.loader.clone();
        Ok(loader.spv_sync(request).await?.into_inner())
    }

    /// The wallet's best block; the hash arrives in internal byte order.
    pub async fn best_block(&self) -> Result<ChainTip, Status> {
        let mut wallet = self.wallet.clone();
        let response = self
            .bounded(async move { wallet.best_block(BestBlockRequest {}).await })
            .await?
            .into_inner();
        ChainTip::from_internal_bytes(response.height, &response.hash).map_err(Status::data_loss)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, Status>>,
    ) -> Result<T, Status> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| {
                Status::deadline_exceeded(format!("no reply within {:?}", self.request_timeout))
            })?
    }
}

async fn handshake(
    addr: SocketAddr,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    limit: Duration,
) -> std::io::Result<TokioIo<TlsStream<TcpStream>>> {
    let connect = async {
        let tcp = TcpStream::connect(addr).await?;
        connector.connect(server_name, tcp).await
    };
    match tokio::time::timeout(limit, connect).await {
        Ok(stream) => stream.map(TokioIo::new),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no TLS handshake with {addr} within {limit:?}"),
        )),
    }
}
