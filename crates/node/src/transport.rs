//! Peer RPC abstraction and the in-memory network used by tests and the
//! simulator.

use crate::TransportError;
use async_trait::async_trait;
use consortium_consensus::{AppendEntries, AppendResponse, RequestVote, VoteResponse};
use consortium_replication::{BlockSource, FetchError};
use consortium_storage::StorageError;
use consortium_types::{BlockBundle, ChainTip, NodeId};
use dashmap::{DashMap, DashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::trace;

/// Outbound RPCs to cluster peers.
///
/// Implementations bound every call by their own timeout. A peer that does
/// not answer in time yields [`TransportError::Timeout`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request_vote(
        &self,
        to: &NodeId,
        request: RequestVote,
    ) -> Result<VoteResponse, TransportError>;

    async fn append_entries(
        &self,
        to: &NodeId,
        message: AppendEntries,
    ) -> Result<AppendResponse, TransportError>;

    async fn fetch_tip(&self, to: &NodeId) -> Result<Option<ChainTip>, TransportError>;

    async fn fetch_block(
        &self,
        to: &NodeId,
        height: u64,
    ) -> Result<Option<BlockBundle>, TransportError>;
}

/// Inbound side of the RPCs, implemented by the node runtime.
///
/// Handlers only touch in-memory state and the local store; they never
/// call back into the network.
pub trait RpcHandler: Send + Sync {
    fn handle_request_vote(&self, request: RequestVote) -> VoteResponse;

    fn handle_append_entries(&self, message: AppendEntries) -> AppendResponse;

    fn handle_fetch_tip(&self) -> Result<Option<ChainTip>, StorageError>;

    fn handle_fetch_block(&self, height: u64) -> Result<Option<BlockBundle>, StorageError>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory network
// ═══════════════════════════════════════════════════════════════════════

/// Routes RPCs between nodes living in one process.
///
/// Supports crashing nodes, directional partitions and per-node response
/// delays. Handlers are held weakly so a dropped node simply becomes
/// unreachable.
#[derive(Default)]
pub struct InMemoryNetwork {
    handlers: DashMap<NodeId, Weak<dyn RpcHandler>>,
    down: DashSet<NodeId>,
    /// `(from, to)` pairs whose messages are dropped.
    partitions: DashSet<(NodeId, NodeId)>,
    delays: DashMap<NodeId, Duration>,
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNetwork")
            .field("handlers", &self.handlers.len())
            .field("down", &self.down.len())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node_id: NodeId, handler: Weak<dyn RpcHandler>) {
        self.handlers.insert(node_id, handler);
    }

    /// Transport handle used by `node_id` to reach its peers.
    pub fn transport(self: &Arc<Self>, node_id: NodeId, timeout: Duration) -> InMemoryTransport {
        InMemoryTransport {
            local: node_id,
            network: Arc::clone(self),
            timeout,
        }
    }

    /// Crash (`false`) or restore (`true`) a node's network presence.
    pub fn set_up(&self, node_id: &NodeId, up: bool) {
        if up {
            self.down.remove(node_id);
        } else {
            self.down.insert(node_id.clone());
        }
    }

    pub fn is_up(&self, node_id: &NodeId) -> bool {
        !self.down.contains(node_id)
    }

    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        self.partitions.insert((a.clone(), b.clone()));
        self.partitions.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.partitions.remove(&(a.clone(), b.clone()));
        self.partitions.remove(&(b.clone(), a.clone()));
    }

    pub fn heal_all(&self) {
        self.partitions.clear();
    }

    /// Delay every answer from `node_id` by `delay`.
    pub fn set_delay(&self, node_id: &NodeId, delay: Duration) {
        if delay.is_zero() {
            self.delays.remove(node_id);
        } else {
            self.delays.insert(node_id.clone(), delay);
        }
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<Arc<dyn RpcHandler>, TransportError> {
        if self.down.contains(from) || self.down.contains(to) {
            return Err(TransportError::PeerUnreachable(to.clone()));
        }
        if self.partitions.contains(&(from.clone(), to.clone())) {
            return Err(TransportError::PeerUnreachable(to.clone()));
        }
        let handler = self
            .handlers
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.clone()))?
            .upgrade();
        handler.ok_or_else(|| TransportError::PeerUnreachable(to.clone()))
    }

    fn delay_of(&self, node_id: &NodeId) -> Duration {
        self.delays.get(node_id).map_or(Duration::ZERO, |d| *d)
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryTransport {
    local: NodeId,
    network: Arc<InMemoryNetwork>,
    timeout: Duration,
}

impl InMemoryTransport {
    async fn call<T, F>(&self, to: &NodeId, rpc: &'static str, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&dyn RpcHandler) -> T + Send,
        T: Send,
    {
        let handler = self.network.route(&self.local, to)?;
        let delay = self.network.delay_of(to);
        trace!(from = %self.local, to = %to, rpc, "In-memory RPC");

        let answer = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            f(handler.as_ref())
        };
        with_timeout(to, self.timeout, answer).await
    }
}

async fn with_timeout<T>(
    peer: &NodeId,
    timeout: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, TransportError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout {
            peer: peer.clone(),
            timeout,
        })
}

fn remote(peer: &NodeId, error: StorageError) -> TransportError {
    TransportError::Remote {
        peer: peer.clone(),
        reason: error.to_string(),
    }
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        to: &NodeId,
        request: RequestVote,
    ) -> Result<VoteResponse, TransportError> {
        self.call(to, "request_vote", move |h| h.handle_request_vote(request))
            .await
    }

    async fn append_entries(
        &self,
        to: &NodeId,
        message: AppendEntries,
    ) -> Result<AppendResponse, TransportError> {
        self.call(to, "append_entries", move |h| h.handle_append_entries(message))
            .await
    }

    async fn fetch_tip(&self, to: &NodeId) -> Result<Option<ChainTip>, TransportError> {
        self.call(to, "fetch_tip", |h| h.handle_fetch_tip())
            .await?
            .map_err(|e| remote(to, e))
    }

    async fn fetch_block(
        &self,
        to: &NodeId,
        height: u64,
    ) -> Result<Option<BlockBundle>, TransportError> {
        self.call(to, "fetch_block", move |h| h.handle_fetch_block(height))
            .await?
            .map_err(|e| remote(to, e))
    }
}

/// Adapts a [`PeerTransport`] peer to the catch-up [`BlockSource`].
pub struct TransportBlockSource<'a> {
    peer: NodeId,
    transport: &'a dyn PeerTransport,
}

impl<'a> TransportBlockSource<'a> {
    pub fn new(peer: NodeId, transport: &'a dyn PeerTransport) -> Self {
        Self { peer, transport }
    }

    fn fetch_error(&self, error: TransportError) -> FetchError {
        FetchError::Unreachable {
            peer: self.peer.clone(),
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl BlockSource for TransportBlockSource<'_> {
    fn peer_id(&self) -> &NodeId {
        &self.peer
    }

    async fn tip(&self) -> Result<Option<ChainTip>, FetchError> {
        self.transport
            .fetch_tip(&self.peer)
            .await
            .map_err(|e| self.fetch_error(e))
    }

    async fn fetch_block(&self, height: u64) -> Result<Option<BlockBundle>, FetchError> {
        self.transport
            .fetch_block(&self.peer, height)
            .await
            .map_err(|e| self.fetch_error(e))
    }
}
