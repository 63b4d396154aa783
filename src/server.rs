//! tarpc RPC server.
//!
//! Incoming calls are turned into [`Command`]s and handed to the node over a
//! channel, so the transport never touches consensus state directly.

use crate::node::{Command, Node};
use crate::rpc::*;
use crate::trace::ContextExtractor;
use futures::{future, prelude::*};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tarpc::{
    server::{self, Channel, incoming::Incoming},
    tokio_serde::formats::Json,
};
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

#[derive(Clone)]
pub struct RaftServer {
    tx: mpsc::Sender<Command>,
}

impl RaftServer {
    pub fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }
}

fn server_span(name: &'static str, ctx: &tarpc::context::Context) -> tracing::Span {
    let span = tracing::debug_span!("rpc", method = name);
    ContextExtractor::new(ctx).attach(&span);
    span
}

impl RaftRpc for RaftServer {
    async fn append_entries(
        self,
        ctx: tarpc::context::Context,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let span = server_span("append_entries", &ctx);
        async move {
            let (tx, rx) = oneshot::channel();
            if self.tx.send(Command::AppendEntries(req, tx)).await.is_err() {
                tracing::warn!("Node is gone, rejecting AppendEntries");
                return AppendEntriesResponse::reject(0);
            }
            rx.await.unwrap_or_else(|_| AppendEntriesResponse::reject(0))
        }
        .instrument(span)
        .await
    }

    async fn request_vote(
        self,
        ctx: tarpc::context::Context,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        let span = server_span("request_vote", &ctx);
        async move {
            let (tx, rx) = oneshot::channel();
            let refused = RequestVoteResponse {
                term: 0,
                vote_granted: false,
            };
            if self.tx.send(Command::RequestVote(req, tx)).await.is_err() {
                tracing::warn!("Node is gone, refusing vote");
                return refused;
            }
            rx.await.unwrap_or(refused)
        }
        .instrument(span)
        .await
    }

    async fn install_snapshot(
        self,
        ctx: tarpc::context::Context,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let span = server_span("install_snapshot", &ctx);
        async move {
            let (tx, rx) = oneshot::channel();
            if self.tx.send(Command::InstallSnapshot(req, tx)).await.is_ok() {
                if let Ok(resp) = rx.await {
                    return resp;
                }
            }
            // Any reply would read as an acknowledgement. Stay silent and
            // let the caller's deadline expire instead.
            tracing::warn!("InstallSnapshot not applied, dropping reply");
            future::pending().await
        }
        .instrument(span)
        .await
    }
}

/// Binds a tarpc listener on `addr` and returns the bound address with a
/// future that serves connections until dropped.
pub async fn listen(
    addr: SocketAddr,
    tx: mpsc::Sender<Command>,
) -> anyhow::Result<(SocketAddr, impl Future<Output = ()> + Send + 'static)> {
    let mut listener =
        tarpc::serde_transport::tcp::listen(&addr, Json::default).await?;
    listener.config_mut().max_frame_length(usize::MAX);
    let local_addr = listener.local_addr();

    let serve = listener
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .max_channels_per_key(16, |t| {
            t.transport()
                .peer_addr()
                .map(|addr| addr.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        })
        .map(move |channel| {
            let server = RaftServer::new(tx.clone());
            channel.execute(server.serve()).for_each(spawn)
        })
        .buffer_unordered(10)
        .for_each(|_| async {});

    Ok((local_addr, serve))
}

/// Exposes `node` over tarpc on `addr`. Returns the bound address.
pub async fn serve_node(node: Node, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let (tx, rx) = mpsc::channel::<Command>(64);
    let (local_addr, serve) = listen(addr, tx).await?;

    let span = tracing::info_span!("rpc_server", id = node.id(), addr = %local_addr);
    tokio::spawn(
        async move {
            if let Err(e) = node.serve_commands(rx).await {
                tracing::error!(error = ?e, "Command dispatcher failed");
            }
        }
        .instrument(span.clone()),
    );
    tokio::spawn(serve.instrument(span));
    tracing::info!(addr = %local_addr, "RPC server listening");
    Ok(local_addr)
}
