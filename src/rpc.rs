use crate::log::Entry;
use crate::raft::NodeId;
use bytes::Bytes;
use tarpc::serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

/// Reply to AppendEntries.
///
/// On a log mismatch the follower fills in `conflict_index` (and
/// `conflict_term` when it holds a conflicting entry at `prev_log_index`)
/// so the leader can skip a whole term per round trip.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub conflict_term: Option<u64>,
    pub conflict_index: Option<u64>,
}

impl AppendEntriesResponse {
    pub fn reject(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_term: None,
            conflict_index: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(crate = "tarpc::serde")]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

#[tarpc::service]
pub trait RaftRpc {
    async fn append_entries(req: AppendEntriesRequest)
    -> AppendEntriesResponse;
    async fn request_vote(req: RequestVoteRequest) -> RequestVoteResponse;
    async fn install_snapshot(
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse;
}

/// Trait for Raft RPC client abstraction.
/// This is dyn-compatible, unlike the tarpc-generated RaftRpc trait.
#[async_trait::async_trait]
pub trait RaftRpcTrait: Send + Sync {
    async fn append_entries(
        &self,
        ctx: tarpc::context::Context,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;

    async fn request_vote(
        &self,
        ctx: tarpc::context::Context,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse>;

    async fn install_snapshot(
        &self,
        ctx: tarpc::context::Context,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;
}

#[async_trait::async_trait]
impl RaftRpcTrait for RaftRpcClient {
    async fn append_entries(
        &self,
        ctx: tarpc::context::Context,
        req: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        RaftRpcClient::append_entries(self, ctx, req)
            .await
            .map_err(Into::into)
    }

    async fn request_vote(
        &self,
        ctx: tarpc::context::Context,
        req: RequestVoteRequest,
    ) -> anyhow::Result<RequestVoteResponse> {
        RaftRpcClient::request_vote(self, ctx, req)
            .await
            .map_err(Into::into)
    }

    async fn install_snapshot(
        &self,
        ctx: tarpc::context::Context,
        req: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        RaftRpcClient::install_snapshot(self, ctx, req)
            .await
            .map_err(Into::into)
    }
}
