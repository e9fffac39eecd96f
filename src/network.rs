//! Inter-cluster peer protocol.
//!
//! Frame layout on the wire: `[u32 length][u8 op][u64 rpc_id][payload]`, all
//! integers big-endian. `length` covers everything after itself. Op codes
//! 0-6 are the stable set every peer must speak; 7-8 are additive.
//!
//! Each connection is split into an owned read half, looped over by
//! [`ClusterPeerManager::session_loop`], and an owned write half shared (via
//! a mutex) between that loop's own responses and any outbound request this
//! manager issues on the same connection. Outbound requests are correlated
//! to their response by `rpc_id` through `pending_requests`.

use crate::block::{MinorBlock, MinorBlockHeader, RootBlock, Transaction};
use crate::cluster::Master;
use crate::error::{ClusterError, ClusterResult};
use crate::types::{FullShardId, Hash};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub type PeerId = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Hello = 0,
    NewMinorBlockHeaderList = 1,
    NewTransactionList = 2,
    GetRootBlockListRequest = 3,
    GetRootBlockListResponse = 4,
    GetPeerListRequest = 5,
    GetPeerListResponse = 6,
    GetMinorBlockListRequest = 7,
    GetMinorBlockListResponse = 8,
}

impl OpCode {
    fn from_u8(b: u8) -> ClusterResult<Self> {
        Ok(match b {
            0 => OpCode::Hello,
            1 => OpCode::NewMinorBlockHeaderList,
            2 => OpCode::NewTransactionList,
            3 => OpCode::GetRootBlockListRequest,
            4 => OpCode::GetRootBlockListResponse,
            5 => OpCode::GetPeerListRequest,
            6 => OpCode::GetPeerListResponse,
            7 => OpCode::GetMinorBlockListRequest,
            8 => OpCode::GetMinorBlockListResponse,
            other => return Err(ClusterError::PeerProtocolViolation(format!("unknown op code {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: u32,
    pub network_id: u32,
    pub peer_id: PeerId,
    pub root_tip_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMinorBlockHeaderListPayload {
    pub headers: Vec<MinorBlockHeader>,
    pub root_tip_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransactionListPayload {
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRootBlockListRequestPayload {
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRootBlockListResponsePayload {
    pub blocks: Vec<RootBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPeerListResponsePayload {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMinorBlockListRequestPayload {
    pub branch: FullShardId,
    pub hashes: Vec<Hash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMinorBlockListResponsePayload {
    pub blocks: Vec<MinorBlock>,
}

/// Events a connected peer hands up to the node's event loop. The node
/// drains these and forwards them into the `Master`.
#[derive(Debug)]
pub enum NetworkEvent {
    PeerConnected(PeerId, SocketAddr),
    PeerDisconnected(PeerId),
    NewMinorBlockHeaders(PeerId, Vec<MinorBlockHeader>),
    NewTransactions(Vec<Transaction>),
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, op: OpCode, rpc_id: u64, payload: &[u8]) -> ClusterResult<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ClusterError::PeerProtocolViolation(format!(
            "outbound frame {} bytes exceeds max {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = (1 + 8 + payload.len()) as u32;
    stream.write_u32(len).await?;
    stream.write_u8(op as u8).await?;
    stream.write_u64(rpc_id).await?;
    stream.write_all(payload).await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> ClusterResult<(OpCode, u64, Vec<u8>)> {
    let len = stream.read_u32().await? as usize;
    if len < 9 {
        return Err(ClusterError::PeerProtocolViolation("frame shorter than header".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(ClusterError::PeerProtocolViolation(format!(
            "inbound frame {len} bytes exceeds max {MAX_FRAME_SIZE}"
        )));
    }
    let op = OpCode::from_u8(stream.read_u8().await?)?;
    let rpc_id = stream.read_u64().await?;
    let mut payload = vec![0u8; len - 9];
    stream.read_exact(&mut payload).await?;
    Ok((op, rpc_id, payload))
}

struct PeerState {
    addr: SocketAddr,
    last_root_tip_height: u64,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
}

/// Owns the listening socket and the set of live peer connections for this
/// cluster. One task per accepted/dialed connection, matching the rest of
/// the crate's single-owner-per-task concurrency model.
pub struct ClusterPeerManager {
    local_peer_id: PeerId,
    network_id: u32,
    version: u32,
    listen_addr: SocketAddr,
    master: Arc<Mutex<Master>>,
    peers: Arc<RwLock<HashMap<PeerId, PeerState>>>,
    event_tx: mpsc::Sender<NetworkEvent>,
    pending_requests: Arc<RwLock<HashMap<u64, oneshot::Sender<Vec<u8>>>>>,
    next_rpc_id: AtomicU64,
}

impl ClusterPeerManager {
    pub fn new(
        local_peer_id: PeerId,
        network_id: u32,
        version: u32,
        listen_addr: SocketAddr,
        master: Arc<Mutex<Master>>,
        event_tx: mpsc::Sender<NetworkEvent>,
    ) -> Self {
        Self {
            local_peer_id,
            network_id,
            version,
            listen_addr,
            master,
            peers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
            next_rpc_id: AtomicU64::new(1),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn start(self: Arc<Self>) -> ClusterResult<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "cluster peer listener bound");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.serve_inbound(stream, addr).await {
                                warn!(%addr, error = %e, "inbound peer session ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });
        Ok(())
    }

    pub async fn connect_peer(self: Arc<Self>, addr: SocketAddr) -> ClusterResult<()> {
        let mut stream = TcpStream::connect(addr).await?;
        let local_tip = self.master.lock().await.root.tip_height();
        let remote_id = self.clone().handshake(&mut stream, local_tip).await?;
        info!(%addr, peer_id = %hex::encode(remote_id), "connected to peer");
        self.run_session(stream, addr, remote_id).await
    }

    async fn serve_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> ClusterResult<()> {
        let local_tip = self.master.lock().await.root.tip_height();
        let remote_id = self.clone().handshake(&mut stream, local_tip).await?;
        info!(%addr, peer_id = %hex::encode(remote_id), "accepted peer");
        self.run_session(stream, addr, remote_id).await
    }

    /// Exchanges `Hello` frames and enforces: matching `version`/`network_id`,
    /// no self-connect, no duplicate peer id.
    async fn handshake(&self, stream: &mut TcpStream, local_root_tip_height: u64) -> ClusterResult<PeerId> {
        let hello = HelloPayload {
            version: self.version,
            network_id: self.network_id,
            peer_id: self.local_peer_id,
            root_tip_height: local_root_tip_height,
        };
        write_frame(stream, OpCode::Hello, 0, &bincode::serialize(&hello)?).await?;

        let (op, _rpc_id, payload) = read_frame(stream).await?;
        if op != OpCode::Hello {
            return Err(ClusterError::PeerProtocolViolation("expected Hello as first frame".into()));
        }
        let remote: HelloPayload = bincode::deserialize(&payload)?;

        if remote.version != self.version {
            return Err(ClusterError::PeerProtocolViolation(format!(
                "version mismatch: local {} remote {}",
                self.version, remote.version
            )));
        }
        if remote.network_id != self.network_id {
            return Err(ClusterError::PeerProtocolViolation(format!(
                "network id mismatch: local {} remote {}",
                self.network_id, remote.network_id
            )));
        }
        if remote.peer_id == self.local_peer_id {
            return Err(ClusterError::PeerProtocolViolation("self-connect detected".into()));
        }
        if self.peers.read().await.contains_key(&remote.peer_id) {
            return Err(ClusterError::PeerProtocolViolation("duplicate peer id".into()));
        }
        Ok(remote.peer_id)
    }

    async fn run_session(&self, stream: TcpStream, addr: SocketAddr, peer_id: PeerId) -> ClusterResult<()> {
        let (mut read_half, write_half) = stream.into_split();
        self.peers.write().await.insert(
            peer_id,
            PeerState {
                addr,
                last_root_tip_height: 0,
                write_half: Arc::new(Mutex::new(write_half)),
            },
        );
        let _ = self.event_tx.send(NetworkEvent::PeerConnected(peer_id, addr)).await;

        let result = self.session_loop(&mut read_half, peer_id).await;

        self.peers.write().await.remove(&peer_id);
        let _ = self.event_tx.send(NetworkEvent::PeerDisconnected(peer_id)).await;
        result
    }

    async fn write_to_peer(&self, peer_id: PeerId, op: OpCode, rpc_id: u64, payload: &[u8]) -> ClusterResult<()> {
        let write_half = {
            let peers = self.peers.read().await;
            peers
                .get(&peer_id)
                .map(|p| p.write_half.clone())
                .ok_or_else(|| ClusterError::PeerClosed("peer not connected".into()))?
        };
        let mut w = write_half.lock().await;
        write_frame(&mut *w, op, rpc_id, payload).await
    }

    /// Issues `op` with `payload` to `peer_id` and waits (up to
    /// `REQUEST_TIMEOUT`) for the response frame matching the `rpc_id` it
    /// was sent under, routed back by `session_loop`.
    async fn send_request(&self, peer_id: PeerId, op: OpCode, payload: &[u8]) -> ClusterResult<Vec<u8>> {
        let rpc_id = self.next_rpc_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_requests.write().await.insert(rpc_id, tx);
        if let Err(e) = self.write_to_peer(peer_id, op, rpc_id, payload).await {
            self.pending_requests.write().await.remove(&rpc_id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(ClusterError::PeerClosed("peer closed before responding".into())),
            Err(_) => {
                self.pending_requests.write().await.remove(&rpc_id);
                Err(ClusterError::RpcTimeout("get-block-list request timed out".into()))
            }
        }
    }

    /// Pulls `hashes` from `peer_id`'s root chain.
    pub async fn request_root_blocks(&self, peer_id: PeerId, hashes: Vec<Hash>) -> ClusterResult<Vec<RootBlock>> {
        let payload = bincode::serialize(&GetRootBlockListRequestPayload { hashes })?;
        let raw = self.send_request(peer_id, OpCode::GetRootBlockListRequest, &payload).await?;
        let resp: GetRootBlockListResponsePayload = bincode::deserialize(&raw)?;
        Ok(resp.blocks)
    }

    /// Pulls `hashes` on shard `branch` from `peer_id`.
    pub async fn request_minor_blocks(
        &self,
        peer_id: PeerId,
        branch: FullShardId,
        hashes: Vec<Hash>,
    ) -> ClusterResult<Vec<MinorBlock>> {
        let payload = bincode::serialize(&GetMinorBlockListRequestPayload { branch, hashes })?;
        let raw = self.send_request(peer_id, OpCode::GetMinorBlockListRequest, &payload).await?;
        let resp: GetMinorBlockListResponsePayload = bincode::deserialize(&raw)?;
        Ok(resp.blocks)
    }

    async fn session_loop(&self, read_half: &mut OwnedReadHalf, peer_id: PeerId) -> ClusterResult<()> {
        loop {
            let (op, rpc_id, payload) = read_frame(read_half).await?;
            match op {
                OpCode::NewMinorBlockHeaderList => {
                    let msg: NewMinorBlockHeaderListPayload = bincode::deserialize(&payload)?;
                    let mut peers = self.peers.write().await;
                    let state = peers
                        .get_mut(&peer_id)
                        .ok_or_else(|| ClusterError::PeerClosed("peer state missing".into()))?;
                    if msg.root_tip_height < state.last_root_tip_height {
                        return Err(ClusterError::PeerProtocolViolation(
                            "peer reported a decreasing root tip height".into(),
                        ));
                    }
                    state.last_root_tip_height = msg.root_tip_height;
                    drop(peers);
                    debug!(peer = %hex::encode(peer_id), count = msg.headers.len(), "received minor headers");
                    let _ = self.event_tx.send(NetworkEvent::NewMinorBlockHeaders(peer_id, msg.headers)).await;
                }
                OpCode::NewTransactionList => {
                    let msg: NewTransactionListPayload = bincode::deserialize(&payload)?;
                    let _ = self.event_tx.send(NetworkEvent::NewTransactions(msg.transactions)).await;
                }
                OpCode::GetPeerListRequest => {
                    let peers = self.peers.read().await;
                    let list: Vec<String> = peers.values().map(|p| p.addr.to_string()).collect();
                    drop(peers);
                    let resp = GetPeerListResponsePayload { peers: list };
                    self.write_to_peer(peer_id, OpCode::GetPeerListResponse, rpc_id, &bincode::serialize(&resp)?)
                        .await?;
                }
                OpCode::GetRootBlockListRequest => {
                    let msg: GetRootBlockListRequestPayload = bincode::deserialize(&payload)?;
                    let blocks = self.master.lock().await.root_blocks_by_hash(&msg.hashes);
                    let resp = GetRootBlockListResponsePayload { blocks };
                    self.write_to_peer(
                        peer_id,
                        OpCode::GetRootBlockListResponse,
                        rpc_id,
                        &bincode::serialize(&resp)?,
                    )
                    .await?;
                }
                OpCode::GetMinorBlockListRequest => {
                    let msg: GetMinorBlockListRequestPayload = bincode::deserialize(&payload)?;
                    let blocks = self.master.lock().await.minor_blocks_by_hash(msg.branch, msg.hashes).await;
                    let resp = GetMinorBlockListResponsePayload { blocks };
                    self.write_to_peer(
                        peer_id,
                        OpCode::GetMinorBlockListResponse,
                        rpc_id,
                        &bincode::serialize(&resp)?,
                    )
                    .await?;
                }
                OpCode::GetRootBlockListResponse | OpCode::GetMinorBlockListResponse | OpCode::GetPeerListResponse => {
                    let mut pending = self.pending_requests.write().await;
                    if let Some(tx) = pending.remove(&rpc_id) {
                        drop(pending);
                        let _ = tx.send(payload);
                    } else {
                        drop(pending);
                        debug!(peer = %hex::encode(peer_id), ?op, rpc_id, "response with no matching pending request dropped");
                    }
                }
                OpCode::Hello => {
                    return Err(ClusterError::PeerProtocolViolation("unexpected second Hello".into()));
                }
            }
        }
    }
}

pub fn random_peer_id() -> PeerId {
    use rand::RngCore;
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    id
}
