use crate::log::Entry;
use crate::raft::{NodeId, RaftState};
use crate::rpc::*;
use std::sync::Arc;
use tokio::sync::Mutex;

enum AppendEntriesError {
    Rejected(AppendEntriesResponse),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppendEntriesError {
    fn from(err: anyhow::Error) -> Self {
        AppendEntriesError::Internal(err)
    }
}

async fn validate_term_and_step_down(
    request_term: u64,
    sender_id: NodeId,
    state: &mut RaftState,
) -> Result<(), AppendEntriesError> {
    if request_term < state.current_term() {
        tracing::debug!(
            id=?state.id,
            req_term=request_term,
            current_term=state.current_term(),
            "Request rejected: term is older than current term"
        );
        return Err(AppendEntriesError::Rejected(AppendEntriesResponse::reject(
            state.current_term(),
        )));
    }

    if request_term > state.current_term() {
        if let Err(e) = state.observe_term_durably(request_term).await {
            tracing::error!(id=?state.id, error=?e, "Failed to persist state after term update");
            return Err(AppendEntriesError::Rejected(
                AppendEntriesResponse::reject(state.current_term()),
            ));
        }
        state.leader_id = Some(sender_id);
    } else {
        if state.role.is_leader() {
            tracing::error!(
                id = state.id,
                other = sender_id,
                term = request_term,
                "Another leader claims the same term"
            );
        }
        if !state.role.is_follower() {
            state.become_follower(request_term, Some(sender_id));
        }
        state.leader_id = Some(sender_id);
    }
    state.reset_election_timer();

    Ok(())
}

/// Checks that our log holds `prev_log_term` at `prev_log_index`. A
/// `prev_log_index` inside the snapshot always matches: those entries are
/// committed.
fn verify_log_match(
    prev_log_index: u64,
    prev_log_term: u64,
    state: &RaftState,
) -> Result<(), AppendEntriesError> {
    let log = state.log();
    if prev_log_index < log.snapshot_index() {
        return Ok(());
    }

    if prev_log_index > log.last_index() {
        tracing::debug!(
            id=?state.id,
            prev_log_index=prev_log_index,
            last_log_idx=log.last_index(),
            "Request rejected: prev_log_index exceeds log length"
        );
        return Err(AppendEntriesError::Rejected(AppendEntriesResponse {
            term: state.current_term(),
            success: false,
            conflict_term: None,
            conflict_index: Some(log.last_index() + 1),
        }));
    }

    match log.term_at(prev_log_index) {
        Some(term) if term == prev_log_term => Ok(()),
        Some(term) => {
            let conflict_index = log.first_index_of_term(prev_log_index);
            tracing::debug!(
                id=?state.id,
                prev_log_index=prev_log_index,
                prev_log_term=prev_log_term,
                actual_term=term,
                conflict_index,
                "Request rejected: prev_log_term mismatch"
            );
            Err(AppendEntriesError::Rejected(AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                conflict_term: Some(term),
                conflict_index: Some(conflict_index),
            }))
        }
        None => Err(anyhow::anyhow!(
            "no term for index {prev_log_index} inside the log"
        )
        .into()),
    }
}

/// Truncates at the first entry whose term differs from ours. Returns true
/// when something was removed.
///
/// An entry we already hold with the same term is never removed: a stale,
/// reordered request must not drop entries a newer request appended.
fn detect_and_truncate_conflicts(entries: &[Entry], state: &mut RaftState) -> bool {
    let snapshot_index = state.log().snapshot_index();
    for entry in entries.iter().filter(|e| e.index > snapshot_index) {
        match state.log().term_at(entry.index) {
            Some(existing_term) if existing_term != entry.term => {
                state.persistent.log.truncate_from(entry.index);
                tracing::info!(
                    id=?state.id,
                    conflict_index=entry.index,
                    old_term=existing_term,
                    new_term=entry.term,
                    "Truncated log due to conflict"
                );
                return true;
            }
            Some(_) => {}
            None => break,
        }
    }
    false
}

fn append_new_entries(entries: &[Entry], sender_id: NodeId, state: &mut RaftState) -> usize {
    let mut appended_count = 0;
    for entry in entries {
        if entry.index > state.get_last_log_idx() {
            state.persistent.log.push(entry.clone());
            appended_count += 1;
        }
    }

    if appended_count > 0 {
        tracing::debug!(
            id=?state.id,
            sender_id=sender_id,
            entries_received=entries.len(),
            entries_appended=appended_count,
            last_log_index=state.get_last_log_idx(),
            "Appended entries to log"
        );
    }
    appended_count
}

/// Merges `entries` into the log and persists the result. If the write
/// fails the log is put back the way it was and the request is rejected.
async fn synchronize_log(
    entries: &[Entry],
    sender_id: NodeId,
    state: &mut RaftState,
) -> Result<(), AppendEntriesError> {
    let snapshot_index = state.log().snapshot_index();
    let Some(first) = entries.iter().map(|e| e.index).find(|&i| i > snapshot_index)
    else {
        return Ok(());
    };
    // Everything a truncation could remove.
    let tail = state.log().entries_from(first, usize::MAX);

    let truncated = detect_and_truncate_conflicts(entries, state);
    let appended = append_new_entries(entries, sender_id, state);

    if truncated || appended > 0 {
        if let Err(e) = state.persist().await {
            tracing::error!(id=?state.id, error=?e, "Failed to persist log");
            state.persistent.log.truncate_from(first);
            for entry in tail {
                state.persistent.log.push(entry);
            }
            return Err(AppendEntriesError::Rejected(
                AppendEntriesResponse::reject(state.current_term()),
            ));
        }
    }
    Ok(())
}

/// Follower commit rule: `min(leader_commit, index of last new entry)`.
fn advance_commit_index(leader_commit: u64, last_new_index: u64, state: &mut RaftState) {
    if leader_commit > state.commit_index {
        state.set_commit_index(leader_commit.min(last_new_index));
    }
}

/// AppendEntries receiver (heartbeats included).
pub async fn handle_append_entries(
    req: &AppendEntriesRequest,
    state: Arc<Mutex<RaftState>>,
) -> anyhow::Result<AppendEntriesResponse> {
    let mut state = state.lock().await;

    let result = async {
        validate_term_and_step_down(req.term, req.leader_id, &mut state).await?;
        verify_log_match(req.prev_log_index, req.prev_log_term, &state)?;
        synchronize_log(&req.entries, req.leader_id, &mut state).await?;
        let last_new_index = req.prev_log_index + req.entries.len() as u64;
        advance_commit_index(req.leader_commit, last_new_index, &mut state);
        Ok::<(), AppendEntriesError>(())
    }
    .await;

    match result {
        Ok(()) => Ok(AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            conflict_term: None,
            conflict_index: None,
        }),
        Err(AppendEntriesError::Rejected(resp)) => Ok(resp),
        Err(AppendEntriesError::Internal(e)) => Err(e),
    }
}
