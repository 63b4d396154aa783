//! The Raft participant handle and its background tasks.
//!
//! Background work is split into one election ticker, one apply worker and,
//! while leading, one replication worker per peer. All of them coordinate
//! through the single `Mutex<RaftState>` and never hold it across a network
//! call.

mod election;
pub mod handlers;
mod lifecycle;
mod replication;
mod snapshot;

use crate::config::Config;
use crate::error::RaftError;
use crate::network::NetworkFactory;
use crate::raft::{NodeId, RaftState};
use crate::rpc::*;
use crate::storage::Storage;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tracing::Instrument;

/// Message delivered to the host service, in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A newly committed command.
    Command { index: u64, command: Bytes },
    /// A snapshot installed from the leader; everything up to `index` is
    /// replaced by `data`.
    Snapshot { term: u64, index: u64, data: Bytes },
}

/// Point-in-time view of a node, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: u64,
    pub role: &'static str,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub snapshot_index: u64,
    pub last_log_index: u64,
}

/// Inbound RPC paired with the channel its reply goes back on.
pub enum Command {
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    InstallSnapshot(
        InstallSnapshotRequest,
        oneshot::Sender<InstallSnapshotResponse>,
    ),
}

/// Handle to one Raft participant. Clones share the same node.
#[derive(Clone)]
pub struct Node {
    id: NodeId,
    pub config: Config,
    pub state: Arc<Mutex<RaftState>>,
    peers: Arc<BTreeMap<NodeId, Arc<dyn RaftRpcTrait>>>,
    replicate_signals: Arc<BTreeMap<NodeId, Arc<Notify>>>,
    apply_signal: Arc<Notify>,
    dead: Arc<AtomicBool>,
}

impl Node {
    /// Creates a node, restores its persisted state and starts the election
    /// ticker and apply worker. Committed entries (and snapshots) are sent
    /// to `apply_tx` in order.
    ///
    /// Must be called within a tokio runtime.
    pub async fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        storage: Arc<dyn Storage>,
        network: &dyn NetworkFactory,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) -> Result<Self, RaftError> {
        config.validate()?;

        let mut peer_ids: Vec<NodeId> =
            peers.into_iter().filter(|p| *p != id).collect();
        peer_ids.sort_unstable();
        peer_ids.dedup();

        let mut clients = BTreeMap::new();
        for &peer in &peer_ids {
            match network.connect(id, peer).await {
                Ok(client) => {
                    clients.insert(peer, client);
                }
                Err(e) => {
                    tracing::warn!(id, peer, error = ?e, "Failed to create client for peer");
                }
            }
        }
        let replicate_signals = peer_ids
            .iter()
            .map(|peer| (*peer, Arc::new(Notify::new())))
            .collect();

        let mut state =
            RaftState::new(id, peer_ids.clone(), config.clone(), storage);
        if state.restore().await? {
            tracing::info!(
                id,
                term = state.current_term(),
                voted_for = ?state.persistent.voted_for,
                snapshot_index = state.log().snapshot_index(),
                last_log_index = state.get_last_log_idx(),
                "Restored state from storage"
            );
        } else {
            tracing::info!(id, "No persisted state found, starting fresh");
        }
        state.reset_election_timer();
        let apply_signal = Arc::clone(&state.apply_signal);
        if state.pending_snapshot {
            apply_signal.notify_one();
        }

        let node = Node {
            id,
            config,
            state: Arc::new(Mutex::new(state)),
            peers: Arc::new(clients),
            replicate_signals: Arc::new(replicate_signals),
            apply_signal,
            dead: Arc::new(AtomicBool::new(false)),
        };

        let span = tracing::info_span!("node", id);
        tokio::spawn(node.clone().run_ticker().instrument(span.clone()));
        tokio::spawn(node.clone().run_apply_loop(apply_tx).instrument(span));

        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns the current term and whether this node believes it leads.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term(), state.role.is_leader())
    }

    /// Proposes a command. Returns `(index, term, is_leader)` immediately;
    /// commitment is observed later on the apply channel.
    pub async fn start(
        &self,
        command: impl Into<Bytes>,
    ) -> Result<(u64, u64, bool), RaftError> {
        let mut state = self.state.lock().await;
        let term = state.current_term();
        if self.killed() {
            return Ok((0, term, false));
        }
        let Some(index) = state.append_as_leader(command.into()) else {
            return Ok((0, term, false));
        };
        if let Err(e) = state.persist().await {
            state.retract_leader_append(index);
            tracing::error!(id = self.id, index, error = ?e, "Failed to persist command");
            return Err(e.into());
        }
        // A single-node cluster is its own majority.
        state.advance_leader_commit();
        drop(state);

        tracing::debug!(id = self.id, index, term, "Appended command as leader");
        for signal in self.replicate_signals.values() {
            signal.notify_one();
        }
        Ok((index, term, true))
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            id: state.id,
            term: state.current_term(),
            role: state.role.name(),
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            snapshot_index: state.log().snapshot_index(),
            last_log_index: state.get_last_log_idx(),
        }
    }

    /// Signals shutdown. Idempotent; background loops exit on their next
    /// check and in-flight RPCs finish on their own.
    pub fn kill(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            tracing::info!(id = self.id, "Node killed");
        }
        self.apply_signal.notify_one();
        for signal in self.replicate_signals.values() {
            signal.notify_one();
        }
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Handles an inbound RequestVote.
    pub async fn request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> RequestVoteResponse {
        handlers::handle_request_vote(&req, Arc::clone(&self.state)).await
    }

    /// Handles an inbound AppendEntries.
    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        match handlers::handle_append_entries(&req, Arc::clone(&self.state))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(id = self.id, error = ?e, "Failed to handle AppendEntries");
                let term = self.state.lock().await.current_term();
                AppendEntriesResponse::reject(term)
            }
        }
    }

    /// Handles an inbound InstallSnapshot. An error means no reply may be
    /// sent: the snapshot could not be made durable.
    pub async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        handlers::handle_install_snapshot(&req, Arc::clone(&self.state)).await
    }

    /// Dispatches RPC commands to the handlers, one task per command.
    pub async fn serve_commands(
        self,
        mut rx: mpsc::Receiver<Command>,
    ) -> anyhow::Result<()> {
        while let Some(cmd) = rx.recv().await {
            if self.killed() {
                break;
            }
            let node = self.clone();
            match cmd {
                Command::AppendEntries(req, resp_tx) => {
                    tokio::spawn(async move {
                        let _ = resp_tx.send(node.append_entries(req).await);
                    });
                }
                Command::RequestVote(req, resp_tx) => {
                    tokio::spawn(async move {
                        let _ = resp_tx.send(node.request_vote(req).await);
                    });
                }
                Command::InstallSnapshot(req, resp_tx) => {
                    tokio::spawn(async move {
                        match node.install_snapshot(req).await {
                            Ok(resp) => {
                                let _ = resp_tx.send(resp);
                            }
                            Err(e) => {
                                tracing::error!(error = ?e, "Failed to handle InstallSnapshot");
                            }
                        }
                    });
                }
            }
        }
        Ok(())
    }
}
