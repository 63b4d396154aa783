use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tarpc::{client, client::RpcError, tokio_serde::formats::Json};
use tokio::sync::Mutex;

use crate::raft::NodeId;
use crate::rpc::*;

/// Produces RPC clients for the other members of the cluster.
#[async_trait]
pub trait NetworkFactory: Send + Sync {
    async fn connect(
        &self,
        from: NodeId,
        to: NodeId,
    ) -> Result<Arc<dyn RaftRpcTrait>, NetworkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("Request timeout")]
    Timeout,
}

/// tarpc-over-TCP network. Peers are addressed by a static id → address map.
#[derive(Clone)]
pub struct TarpcNetworkFactory {
    addrs: HashMap<NodeId, SocketAddr>,
    connect_timeout: Duration,
}

impl TarpcNetworkFactory {
    pub fn new(
        addrs: HashMap<NodeId, SocketAddr>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            addrs,
            connect_timeout,
        }
    }
}

#[async_trait]
impl NetworkFactory for TarpcNetworkFactory {
    async fn connect(
        &self,
        _from: NodeId,
        to: NodeId,
    ) -> Result<Arc<dyn RaftRpcTrait>, NetworkError> {
        let addr = *self.addrs.get(&to).ok_or(NetworkError::UnknownPeer(to))?;
        Ok(Arc::new(TarpcPeer::new(to, addr, self.connect_timeout)))
    }
}

/// Lazily connected tarpc client.
///
/// Peers may come up in any order, so the TCP connection is opened on first
/// use and dropped after any failed call; the next call reconnects.
pub struct TarpcPeer {
    id: NodeId,
    addr: SocketAddr,
    connect_timeout: Duration,
    client: Mutex<Option<RaftRpcClient>>,
}

impl TarpcPeer {
    pub fn new(id: NodeId, addr: SocketAddr, connect_timeout: Duration) -> Self {
        Self {
            id,
            addr,
            connect_timeout,
            client: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<RaftRpcClient, NetworkError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let connect =
            tarpc::serde_transport::tcp::connect(self.addr, Json::default);
        let transport = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!(
                    "Failed to connect to {} ({}): {}",
                    self.id, self.addr, e
                ))
            })?;
        let client =
            RaftRpcClient::new(client::Config::default(), transport).spawn();
        tracing::debug!(peer = self.id, addr = ?self.addr, "Connected to peer");
        *slot = Some(client.clone());
        Ok(client)
    }

    async fn call<R, F, Fut>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(RaftRpcClient) -> Fut + Send,
        Fut: Future<Output = Result<R, RpcError>> + Send,
        R: Send,
    {
        let client = self.client().await?;
        match f(client).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                *self.client.lock().await = None;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl RaftRpcTrait for TarpcPeer {
    async fn append_entries(
        &self,
        ctx: tarpc::context::Context,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        self.call(|client| async move {
            RaftRpcClient::append_entries(&client, ctx, req).await
        })
        .await
    }

    async fn request_vote(
        &self,
        ctx: tarpc::context::Context,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        self.call(|client| async move {
            RaftRpcClient::request_vote(&client, ctx, req).await
        })
        .await
    }

    async fn install_snapshot(
        &self,
        ctx: tarpc::context::Context,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        self.call(|client| async move {
            RaftRpcClient::install_snapshot(&client, ctx, req).await
        })
        .await
    }
}
