//! In-process network for running whole clusters inside one runtime.
//!
//! [`LocalNetwork`] routes RPCs straight into the target [`Node`]'s
//! handlers and can partition nodes, lose or delay messages, and swap a node
//! for a restarted instance. It is used by the integration tests and works
//! under a paused tokio clock.

use crate::network::{NetworkError, NetworkFactory};
use crate::node::Node;
use crate::raft::NodeId;
use crate::rpc::*;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Registry {
    nodes: HashMap<NodeId, Node>,
    connected: HashSet<NodeId>,
    unreliable: bool,
    rpc_count: u64,
}

/// Shared switchboard. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `node` under its id, replacing any previous instance, and
    /// connects it.
    pub async fn register(&self, node: Node) {
        let mut reg = self.inner.lock().await;
        reg.connected.insert(node.id());
        reg.nodes.insert(node.id(), node);
    }

    /// Detaches a node; RPCs to it fail until a new instance registers.
    pub async fn unregister(&self, id: NodeId) -> Option<Node> {
        let mut reg = self.inner.lock().await;
        reg.connected.remove(&id);
        reg.nodes.remove(&id)
    }

    pub async fn connect_node(&self, id: NodeId) {
        self.inner.lock().await.connected.insert(id);
    }

    pub async fn disconnect_node(&self, id: NodeId) {
        self.inner.lock().await.connected.remove(&id);
    }

    pub async fn is_connected(&self, id: NodeId) -> bool {
        self.inner.lock().await.connected.contains(&id)
    }

    /// When unreliable, requests and replies are delayed and ~10% are lost.
    pub async fn set_unreliable(&self, unreliable: bool) {
        self.inner.lock().await.unreliable = unreliable;
    }

    /// Number of RPCs attempted so far.
    pub async fn rpc_count(&self) -> u64 {
        self.inner.lock().await.rpc_count
    }

    async fn route(&self, from: NodeId, to: NodeId) -> Result<Node, NetworkError> {
        let (target, unreliable) = {
            let mut reg = self.inner.lock().await;
            reg.rpc_count += 1;
            let reachable =
                reg.connected.contains(&from) && reg.connected.contains(&to);
            let target = if reachable { reg.nodes.get(&to).cloned() } else { None };
            (target, reg.unreliable)
        };

        if unreliable {
            let delay = rand::rng().random_range(0..27);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if rand::rng().random_bool(0.1) {
                return Err(NetworkError::Timeout);
            }
        }

        match target {
            Some(node) if !node.killed() => Ok(node),
            _ => {
                // A dead link looks like a slow timeout, not an instant error.
                let delay = rand::rng().random_range(0..100);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Err(NetworkError::Unreachable(to))
            }
        }
    }

    /// The reply is lost if either end was cut off while the call ran.
    async fn deliver<R>(&self, from: NodeId, to: NodeId, reply: R) -> Result<R, NetworkError> {
        let (reachable, unreliable) = {
            let reg = self.inner.lock().await;
            (
                reg.connected.contains(&from) && reg.connected.contains(&to),
                reg.unreliable,
            )
        };
        if !reachable {
            return Err(NetworkError::Unreachable(to));
        }
        if unreliable && rand::rng().random_bool(0.1) {
            return Err(NetworkError::Timeout);
        }
        Ok(reply)
    }
}

#[async_trait]
impl NetworkFactory for LocalNetwork {
    async fn connect(
        &self,
        from: NodeId,
        to: NodeId,
    ) -> Result<Arc<dyn RaftRpcTrait>, NetworkError> {
        Ok(Arc::new(LocalClient {
            from,
            to,
            network: self.clone(),
        }))
    }
}

struct LocalClient {
    from: NodeId,
    to: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl RaftRpcTrait for LocalClient {
    async fn append_entries(
        &self,
        _ctx: tarpc::context::Context,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let node = self.network.route(self.from, self.to).await?;
        let resp = node.append_entries(req).await;
        Ok(self.network.deliver(self.from, self.to, resp).await?)
    }

    async fn request_vote(
        &self,
        _ctx: tarpc::context::Context,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        let node = self.network.route(self.from, self.to).await?;
        let resp = node.request_vote(req).await;
        Ok(self.network.deliver(self.from, self.to, resp).await?)
    }

    async fn install_snapshot(
        &self,
        _ctx: tarpc::context::Context,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        let node = self.network.route(self.from, self.to).await?;
        let resp = node.install_snapshot(req).await?;
        Ok(self.network.deliver(self.from, self.to, resp).await?)
    }
}
