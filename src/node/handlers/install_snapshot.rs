//! InstallSnapshot RPC handler
//!
//! Implements Raft Figure 13 - InstallSnapshot RPC Receiver implementation:
//! 1. Reply immediately if term < currentTerm
//! 2. Save the snapshot, discarding any older one
//! 3. If existing log entry has same index and term as snapshot's last included entry,
//!    retain log entries following it and reply
//! 4. Otherwise discard the entire log
//! 5. Hand the snapshot to the host through the apply worker
//!
//! Snapshots covering nothing beyond our commit index are stale and ignored;
//! our own log already reaches at least as far.

use crate::raft::RaftState;
use crate::rpc::{InstallSnapshotRequest, InstallSnapshotResponse};
use std::sync::Arc;
use tokio::sync::Mutex;

pub async fn handle_install_snapshot(
    req: &InstallSnapshotRequest,
    state: Arc<Mutex<RaftState>>,
) -> anyhow::Result<InstallSnapshotResponse> {
    let mut state = state.lock().await;

    // Step 1: Reply immediately if term < currentTerm
    if req.term < state.current_term() {
        return Ok(InstallSnapshotResponse {
            term: state.current_term(),
        });
    }

    // Nothing below may outlive a failed write.
    let checkpoint = state.checkpoint();
    let term_changed = req.term > state.current_term();
    if !state.role.is_follower() || term_changed {
        state.become_follower(req.term, Some(req.leader_id));
    }
    state.leader_id = Some(req.leader_id);
    state.reset_election_timer();

    if req.last_included_index <= state.commit_index {
        tracing::debug!(
            id = state.id,
            last_included_index = req.last_included_index,
            commit_index = state.commit_index,
            "Ignoring stale snapshot"
        );
        if term_changed {
            if let Err(e) = state.persist().await {
                state.rollback(checkpoint);
                return Err(e.into());
            }
        }
        return Ok(InstallSnapshotResponse {
            term: state.current_term(),
        });
    }

    // Steps 2-4
    state
        .persistent
        .log
        .compact_to(req.last_included_index, req.last_included_term);
    state.snapshot = req.data.clone();
    state.pending_snapshot = true;
    if let Err(e) = state.persist_with_snapshot().await {
        state.rollback(checkpoint);
        tracing::error!(id = state.id, error = ?e, "Failed to persist installed snapshot");
        return Err(e.into());
    }

    tracing::info!(
        id = state.id,
        leader_id = req.leader_id,
        last_included_index = req.last_included_index,
        last_included_term = req.last_included_term,
        retained = state.log().len(),
        "Installed snapshot from leader"
    );

    // Step 5
    state.set_commit_index(req.last_included_index);

    Ok(InstallSnapshotResponse {
        term: state.current_term(),
    })
}
