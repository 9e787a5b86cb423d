use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::raft::node::RaftNode;
use crate::raft::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};

/// A failed RPC attempt. Every variant means "unknown outcome": the request
/// may or may not have reached the peer, and the caller simply does not
/// count this peer's vote or acknowledgement for the current round.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer {0} is unreachable")]
    Unreachable(u64),

    #[error("request was dropped before a reply was produced")]
    Dropped,
}

/// The network collaborator: delivers RPCs to other peers with no ordering
/// guarantee between calls and no guarantee of eventual delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request_vote(
        &self,
        peer: u64,
        req: VoteRequest,
    ) -> std::result::Result<VoteResponse, RpcError>;

    async fn append_entries(
        &self,
        peer: u64,
        req: AppendEntriesRequest,
    ) -> std::result::Result<AppendEntriesResponse, RpcError>;
}

#[derive(Default)]
struct NetworkInner {
    peers: HashMap<u64, Arc<RaftNode>>,
    /// Directed (from, to) pairs whose traffic is currently dropped.
    blocked: HashSet<(u64, u64)>,
}

/// An in-process cluster fabric connecting `RaftNode`s directly, with
/// partition controls for exercising minority/majority splits.
///
/// Construction order: create the network, hand each node a
/// [`InMemoryNetwork::handle`] as its transport, then [`register`] the node.
///
/// [`register`]: InMemoryNetwork::register
pub struct InMemoryNetwork {
    inner: RwLock<NetworkInner>,
}

impl InMemoryNetwork {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(NetworkInner::default()),
        })
    }

    /// Make `node` reachable under `id`.
    pub async fn register(&self, id: u64, node: Arc<RaftNode>) {
        self.inner.write().await.peers.insert(id, node);
    }

    /// A transport view of this network as seen from `origin`.
    pub fn handle(self: &Arc<Self>, origin: u64) -> Arc<NetworkHandle> {
        Arc::new(NetworkHandle {
            origin,
            network: Arc::clone(self),
        })
    }

    /// Drop all traffic between the two groups, in both directions.
    pub async fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        let mut inner = self.inner.write().await;
        for &a in group_a {
            for &b in group_b {
                inner.blocked.insert((a, b));
                inner.blocked.insert((b, a));
            }
        }
    }

    /// Restore traffic between the two groups.
    pub async fn heal(&self, group_a: &[u64], group_b: &[u64]) {
        let mut inner = self.inner.write().await;
        for &a in group_a {
            for &b in group_b {
                inner.blocked.remove(&(a, b));
                inner.blocked.remove(&(b, a));
            }
        }
    }

    /// Cut one peer off from every other registered peer.
    pub async fn isolate(&self, id: u64) {
        let others = self.other_ids(id).await;
        self.partition(&[id], &others).await;
    }

    /// Reconnect a previously isolated peer.
    pub async fn heal_node(&self, id: u64) {
        let others = self.other_ids(id).await;
        self.heal(&[id], &others).await;
    }

    async fn other_ids(&self, id: u64) -> Vec<u64> {
        self.inner
            .read()
            .await
            .peers
            .keys()
            .copied()
            .filter(|&other| other != id)
            .collect()
    }

    async fn route(&self, origin: u64, target: u64) -> Result<Arc<RaftNode>, RpcError> {
        let inner = self.inner.read().await;
        if inner.blocked.contains(&(origin, target)) {
            return Err(RpcError::Unreachable(target));
        }
        inner
            .peers
            .get(&target)
            .cloned()
            .ok_or(RpcError::Unreachable(target))
    }
}

/// Per-origin view of an [`InMemoryNetwork`].
pub struct NetworkHandle {
    origin: u64,
    network: Arc<InMemoryNetwork>,
}

#[async_trait]
impl Transport for NetworkHandle {
    async fn request_vote(
        &self,
        peer: u64,
        req: VoteRequest,
    ) -> std::result::Result<VoteResponse, RpcError> {
        let node = self.network.route(self.origin, peer).await?;
        // A handler error means the peer mutated nothing it could not
        // persist; from the network's view no reply was ever sent.
        node.handle_vote_request(req).await.map_err(|_| RpcError::Dropped)
    }

    async fn append_entries(
        &self,
        peer: u64,
        req: AppendEntriesRequest,
    ) -> std::result::Result<AppendEntriesResponse, RpcError> {
        let node = self.network.route(self.origin, peer).await?;
        node.handle_append_entries(req)
            .await
            .map_err(|_| RpcError::Dropped)
    }
}
