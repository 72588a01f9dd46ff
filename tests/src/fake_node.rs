// In-process stand-in for a network of full nodes.
//
// Each fake node serves the JSON-RPC subset the harness uses over HTTP, or
// HTTPS when spawned with a certificate. Chain state lives in one shared
// FakeNetwork: blocks are derived hashes, and every request first lets each
// connected group of nodes adopt the longest chain among them, which is how
// a join propagates. Links are directed like real p2p connections: the
// dialer lists the peer's listen address, the dialed side lists the dialer's
// outbound source port as an inbound peer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::serve::Listener;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use spv_harness::node::{NodeProcess, NodeRpc, RpcEndpoint};
use spv_harness::process::allocate_local_addr;
use spv_harness::ChainTip;

use crate::{TestResult, TlsFixture};

type Hash = [u8; 32];

const ERR_MISC: i64 = -1;
const ERR_METHOD_NOT_FOUND: i64 = -32601;
const ERR_INVALID_PARAMS: i64 = -32602;

#[derive(Debug)]
struct NodeState {
    chain: Vec<Hash>,
    /// Live outbound peers, keyed by their p2p address.
    peers: BTreeSet<SocketAddr>,
    /// Peers added with `addnode add`; removing one leaves the live
    /// connection up.
    persistent: BTreeSet<SocketAddr>,
    /// Source port of this node's outbound connections.
    outbound_port: u16,
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<SocketAddr, NodeState>,
}

impl NetworkState {
    // Within every connected group, nodes behind the longest chain adopt it.
    fn settle(&mut self) {
        let mut adjacency: HashMap<SocketAddr, Vec<SocketAddr>> = HashMap::new();
        for (addr, node) in &self.nodes {
            for peer in node.peers.iter().filter(|p| self.nodes.contains_key(p)) {
                adjacency.entry(*addr).or_default().push(*peer);
                adjacency.entry(*peer).or_default().push(*addr);
            }
        }

        let mut seen = HashSet::new();
        let starts: Vec<SocketAddr> = self.nodes.keys().copied().collect();
        for start in starts {
            if !seen.insert(start) {
                continue;
            }
            let mut group = vec![start];
            let mut i = 0;
            while i < group.len() {
                let current = group[i];
                i += 1;
                for next in adjacency.get(&current).into_iter().flatten() {
                    if seen.insert(*next) {
                        group.push(*next);
                    }
                }
            }

            let longest = group
                .iter()
                .map(|a| &self.nodes[a].chain)
                .max_by_key(|c| c.len())
                .cloned();
            if let Some(longest) = longest {
                for addr in &group {
                    if let Some(node) = self.nodes.get_mut(addr) {
                        if node.chain.len() < longest.len() {
                            node.chain = longest.clone();
                        }
                    }
                }
            }
        }
    }

    fn tip(&self, addr: &SocketAddr) -> Option<ChainTip> {
        let chain = &self.nodes.get(addr)?.chain;
        let height = u32::try_from(chain.len().checked_sub(1)?).ok()?;
        Some(ChainTip::new(height, *chain.last()?))
    }

    // Outbound entries first, then every live node that dialed `me`.
    fn peer_info(&self, me: &SocketAddr) -> Option<Vec<Value>> {
        let node = self.nodes.get(me)?;
        let outbound = node
            .peers
            .iter()
            .filter(|p| self.nodes.contains_key(p))
            .map(|p| (p.to_string(), false));
        let inbound = self
            .nodes
            .values()
            .filter(|other| other.peers.contains(me))
            .map(|other| (format!("127.0.0.1:{}", other.outbound_port), true));
        let peers = outbound
            .chain(inbound)
            .enumerate()
            .map(|(id, (addr, inbound))| json!({ "id": id + 1, "addr": addr, "inbound": inbound }))
            .collect();
        Some(peers)
    }

    // Drop the connection `me` lists under `addr`, whichever side dialed it.
    fn disconnect(&mut self, me: SocketAddr, addr: SocketAddr) -> Result<(), (i64, String)> {
        let node = self.nodes.get_mut(&me).ok_or((ERR_MISC, "node stopped".into()))?;
        if node.peers.remove(&addr) {
            return Ok(());
        }
        let dialer = self
            .nodes
            .values_mut()
            .find(|other| other.outbound_port == addr.port() && other.peers.contains(&me));
        match dialer {
            Some(other) => {
                other.peers.remove(&me);
                Ok(())
            }
            None => Err((ERR_MISC, format!("peer {addr} not found"))),
        }
    }
}

/// Shared chain and peer state of every fake node (and the fake wallet).
#[derive(Debug, Clone, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fake node at genesis with its own JSON-RPC server.
    pub async fn spawn_node(&self) -> TestResult<FakeNode> {
        let (p2p_addr, app) = self.register()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let rpc_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        debug!("fake node p2p {} rpc {}", p2p_addr, rpc_addr);
        Ok(self.node(p2p_addr, rpc_addr, None, shutdown_tx))
    }

    /// Like [`spawn_node`](Self::spawn_node), with JSON-RPC served over TLS
    /// using `identity`.
    pub async fn spawn_tls_node(&self, identity: &TlsFixture) -> TestResult<FakeNode> {
        let acceptor = TlsAcceptor::from(Arc::new(identity.server_config()?));
        let (p2p_addr, app) = self.register()?;
        let tcp = TcpListener::bind("127.0.0.1:0").await?;
        let rpc_addr = tcp.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(TlsListener { tcp, acceptor }, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        debug!("fake TLS node p2p {} rpc {}", p2p_addr, rpc_addr);
        let cert = Some(identity.cert_pem.clone().into_bytes());
        Ok(self.node(p2p_addr, rpc_addr, cert, shutdown_tx))
    }

    // Join the network at genesis; returns the p2p address and RPC router.
    fn register(&self) -> TestResult<(SocketAddr, Router)> {
        let p2p_addr = allocate_local_addr()?;
        let outbound_port = allocate_local_addr()?.port();
        let state = NodeState {
            chain: vec![genesis()],
            peers: BTreeSet::new(),
            persistent: BTreeSet::new(),
            outbound_port,
        };
        self.lock().nodes.insert(p2p_addr, state);
        let ctx = NodeCtx {
            network: self.clone(),
            me: p2p_addr,
        };
        Ok((p2p_addr, Router::new().route("/", post(handle_rpc)).with_state(ctx)))
    }

    fn node(
        &self,
        p2p_addr: SocketAddr,
        rpc_addr: SocketAddr,
        tls_cert: Option<Vec<u8>>,
        shutdown: oneshot::Sender<()>,
    ) -> FakeNode {
        FakeNode {
            p2p_addr,
            rpc_addr,
            tls_cert,
            network: self.clone(),
            shutdown: Some(shutdown),
        }
    }

    /// Current tip of the node listening on `p2p_addr`.
    pub fn tip_of(&self, p2p_addr: SocketAddr) -> Option<ChainTip> {
        let mut state = self.lock();
        state.settle();
        state.tip(&p2p_addr)
    }

    /// What an SPV client connected to `peers` would follow: the longest
    /// chain among them, the first peer winning ties.
    pub fn best_among(&self, peers: &[SocketAddr]) -> Option<ChainTip> {
        let mut state = self.lock();
        state.settle();
        peers
            .iter()
            .filter_map(|p| state.tip(p))
            .fold(None, |best: Option<ChainTip>, tip| match best {
                Some(b) if b.height >= tip.height => Some(b),
                _ => Some(tip),
            })
    }

    fn dispatch(
        &self,
        me: SocketAddr,
        method: &str,
        params: &[Value],
    ) -> Result<Value, (i64, String)> {
        let mut state = self.lock();
        state.settle();
        let result = match method {
            "generate" => {
                let count = params
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or((ERR_INVALID_PARAMS, "missing count".into()))?;
                let node = state.nodes.get_mut(&me).ok_or((ERR_MISC, "node stopped".into()))?;
                let mut mined = Vec::new();
                for _ in 0..count {
                    let parent = node.chain.last().copied().unwrap_or_else(genesis);
                    let hash = derive_block(&parent, me, node.chain.len());
                    node.chain.push(hash);
                    mined.push(display_hex(&hash));
                }
                state.settle();
                json!(mined)
            }
            "getbestblock" => {
                let tip = state.tip(&me).ok_or((ERR_MISC, "node stopped".into()))?;
                json!({ "hash": tip.display_hex(), "height": tip.height })
            }
            "addnode" => {
                let peer = param_addr(params, 0)?;
                let command = params.get(1).and_then(Value::as_str).unwrap_or_default();
                let node = state.nodes.get_mut(&me).ok_or((ERR_MISC, "node stopped".into()))?;
                match command {
                    "add" => {
                        node.persistent.insert(peer);
                        node.peers.insert(peer);
                    }
                    "remove" => {
                        if !node.persistent.remove(&peer) {
                            return Err((ERR_MISC, format!("node {peer} not found")));
                        }
                    }
                    other => {
                        let reason = format!("invalid addnode command {other:?}");
                        return Err((ERR_INVALID_PARAMS, reason));
                    }
                }
                state.settle();
                Value::Null
            }
            "node" => {
                if params.first().and_then(Value::as_str) != Some("disconnect") {
                    return Err((ERR_INVALID_PARAMS, "only disconnect is supported".into()));
                }
                let peer = param_addr(params, 1)?;
                state.disconnect(me, peer)?;
                Value::Null
            }
            "getpeerinfo" => {
                let peers = state.peer_info(&me).ok_or((ERR_MISC, "node stopped".into()))?;
                json!(peers)
            }
            other => return Err((ERR_METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        };
        Ok(result)
    }
}

/// One running fake node. Dropping it stops the RPC server and removes the
/// node from the network.
#[derive(Debug)]
pub struct FakeNode {
    pub p2p_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    /// PEM certificate the RPC server presents, if it serves TLS.
    pub tls_cert: Option<Vec<u8>>,
    network: FakeNetwork,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeNode {
    pub fn rpc_endpoint(&self) -> RpcEndpoint {
        RpcEndpoint {
            addr: self.rpc_addr,
            user: "user".into(),
            pass: "pass".into(),
            tls_cert: self.tls_cert.clone(),
            request_timeout: Duration::from_secs(2),
        }
    }

    /// A harness-side handle for this node, as if the harness had spawned it.
    pub fn attach(&self, name: &str, data_dir: &Path) -> TestResult<NodeProcess> {
        let rpc = NodeRpc::new(&self.rpc_endpoint())?;
        Ok(NodeProcess::attach(name, data_dir.join(name), self.p2p_addr, rpc))
    }

    /// Stop answering RPC and leave the network.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.network.lock().nodes.remove(&self.p2p_addr);
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct NodeCtx {
    network: FakeNetwork,
    me: SocketAddr,
}

#[derive(Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    id: Value,
}

async fn handle_rpc(State(ctx): State<NodeCtx>, Json(req): Json<RpcRequest>) -> Json<Value> {
    let body = match ctx.network.dispatch(ctx.me, &req.method, &req.params) {
        Ok(result) => json!({ "result": result, "error": null, "id": req.id }),
        Err((code, message)) => json!({
            "result": null,
            "error": { "code": code, "message": message },
            "id": req.id,
        }),
    };
    Json(body)
}

// Serves RPC over TLS; a failed handshake drops that connection only.
struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (tcp, addr) = match self.tcp.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("fake node accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };
            match self.acceptor.accept(tcp).await {
                Ok(tls) => return (tls, addr),
                Err(e) => debug!("fake node TLS handshake with {} failed: {}", addr, e),
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

fn param_addr(params: &[Value], index: usize) -> Result<SocketAddr, (i64, String)> {
    params
        .get(index)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or((ERR_INVALID_PARAMS, format!("parameter {index} must be a host:port address")))
}

fn genesis() -> Hash {
    Sha256::digest(b"fake simnet genesis").into()
}

fn derive_block(parent: &Hash, miner: SocketAddr, height: usize) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(parent);
    hasher.update(miner.to_string().as_bytes());
    hasher.update(height.to_le_bytes());
    hasher.finalize().into()
}

fn display_hex(hash: &Hash) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}
