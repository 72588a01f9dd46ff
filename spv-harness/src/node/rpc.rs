//! JSON-RPC client for the full node's control surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::tip::ChainTip;
use crate::tls::{pinned_client_config, TlsError};

/// Failure of one node RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request never produced a response body.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The node's certificate could not be pinned.
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    /// The node answered with a JSON-RPC error object.
    #[error("node returned error {code}: {message}")]
    Node {
        /// JSON-RPC error code.
        code: i64,
        /// Human readable message from the node.
        message: String,
    },
    /// The response was not the JSON the call expects.
    #[error("malformed response ({status}): {reason}")]
    Decode {
        /// HTTP status of the response.
        status: u16,
        /// What failed to decode.
        reason: String,
    },
}

#[derive(Serialize)]
struct JsonRequestBody<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonResponseBody {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<JsonError>,
}

#[derive(Deserialize)]
struct JsonError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BestBlock {
    hash: String,
    height: u64,
}

/// One entry of `getpeerinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerInfo {
    /// Connection id assigned by the node.
    #[serde(default)]
    pub id: u64,
    /// Remote address. For outbound peers this is the address that was
    /// dialed; for inbound peers it is the remote's ephemeral source port.
    pub addr: String,
    /// Whether the remote dialed this node.
    #[serde(default)]
    pub inbound: bool,
}

/// `addnode` sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddNodeCommand {
    /// Add a persistent outbound peer.
    Add,
    /// Forget a persistent peer; the live connection stays up.
    Remove,
}

impl AddNodeCommand {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
        }
    }
}

/// Connection settings for [`NodeRpc::new`].
#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    /// RPC listen address.
    pub addr: SocketAddr,
    /// Basic-auth user.
    pub user: String,
    /// Basic-auth password.
    pub pass: String,
    /// PEM certificate to pin; `None` selects plain HTTP.
    pub tls_cert: Option<Vec<u8>>,
    /// Whole-request timeout.
    pub request_timeout: Duration,
}

/// Basic-auth JSON-RPC client bound to one node.
pub struct NodeRpc {
    client: Client,
    url: Url,
    user: String,
    pass: String,
    next_id: AtomicU64,
}

impl NodeRpc {
    /// Client for `endpoint`. With a certificate, HTTPS trusts exactly that
    /// certificate and nothing else.
    pub fn new(endpoint: &RpcEndpoint) -> Result<Self, RpcError> {
        let mut builder = Client::builder().timeout(endpoint.request_timeout);
        let scheme = match &endpoint.tls_cert {
            Some(pem) => {
                builder = builder.use_preconfigured_tls(pinned_client_config(pem)?);
                "https"
            }
            None => "http",
        };
        let url = Url::parse(&format!("{scheme}://{}/", endpoint.addr)).map_err(|e| {
            RpcError::Decode {
                status: 0,
                reason: format!("invalid rpc address: {e}"),
            }
        })?;
        Ok(Self {
            client: builder.build()?,
            url,
            user: endpoint.user.clone(),
            pass: endpoint.pass.clone(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Where requests are posted.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Issue `method` and decode its `result`.
    pub async fn call<D: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<D, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRequestBody {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };
        let response = self
            .client
            .post(self.url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        // Error replies may arrive with a non-2xx status and a JSON body, so
        // the body is decoded before the status is considered.
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body: JsonResponseBody = serde_json::from_slice(&bytes).map_err(|e| {
            let preview = String::from_utf8_lossy(&bytes[..bytes.len().min(200)]);
            RpcError::Decode {
                status,
                reason: format!("{e}: {preview}"),
            }
        })?;

        if let Some(error) = body.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }
        debug!("rpc {} #{} -> {}", method, id, body.result);
        serde_json::from_value(body.result).map_err(|e| RpcError::Decode {
            status,
            reason: e.to_string(),
        })
    }

    /// Mine `count` blocks; returns their display-order hashes.
    pub async fn generate(&self, count: u32) -> Result<Vec<String>, RpcError> {
        self.call("generate", json!([count])).await
    }

    /// Current best (height, hash) of the node's chain.
    pub async fn best_block(&self) -> Result<ChainTip, RpcError> {
        let best: BestBlock = self.call("getbestblock", json!([])).await?;
        ChainTip::from_display_hex(best.height, &best.hash)
            .map_err(|reason| RpcError::Decode { status: 200, reason })
    }

    /// Run `addnode <peer> <command>`.
    pub async fn add_node(
        &self,
        peer: SocketAddr,
        command: AddNodeCommand,
    ) -> Result<(), RpcError> {
        self.call::<Value>("addnode", json!([peer.to_string(), command.as_str()]))
            .await
            .map(drop)
    }

    /// Drop the live connection to the peer the node lists under `addr`.
    pub async fn disconnect_peer(&self, addr: &str) -> Result<(), RpcError> {
        self.call::<Value>("node", json!(["disconnect", addr]))
            .await
            .map(drop)
    }

    /// Currently connected peers, both directions.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, RpcError> {
        self.call("getpeerinfo", json!([])).await
    }
}
