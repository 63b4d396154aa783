use crate::raft::{NodeId, RaftState};
use crate::rpc::*;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Why a vote was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refusal {
    StaleTerm,
    AlreadyVoted(NodeId),
    LogBehind,
}

fn check_candidate(state: &RaftState, req: &RequestVoteRequest) -> Option<Refusal> {
    if req.term < state.current_term() {
        return Some(Refusal::StaleTerm);
    }
    match state.persistent.voted_for {
        Some(voted) if voted != req.candidate_id => {
            return Some(Refusal::AlreadyVoted(voted));
        }
        _ => {}
    }
    if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        return Some(Refusal::LogBehind);
    }
    None
}

/// RequestVote receiver.
///
/// A granted vote is persisted and resets the election timer before the
/// reply leaves; if persisting fails the vote is refused and term and vote
/// stay as they were.
pub async fn handle_request_vote(
    req: &RequestVoteRequest,
    state: Arc<Mutex<RaftState>>,
) -> RequestVoteResponse {
    let mut state = state.lock().await;
    let refuse = |term| RequestVoteResponse {
        term,
        vote_granted: false,
    };

    if let Err(e) = state.observe_term_durably(req.term).await {
        tracing::error!(id = state.id, term = req.term, error = ?e, "Failed to persist newer term");
        return refuse(state.current_term());
    }

    if let Some(refusal) = check_candidate(&state, req) {
        tracing::debug!(
            id = state.id,
            candidate = req.candidate_id,
            req_term = req.term,
            term = state.current_term(),
            last_log_index = state.get_last_log_idx(),
            last_log_term = state.get_last_log_term(),
            ?refusal,
            "Refused vote"
        );
        return refuse(state.current_term());
    }

    if state.persistent.voted_for.is_none() {
        state.persistent.voted_for = Some(req.candidate_id);
        if let Err(e) = state.persist().await {
            tracing::error!(id = state.id, error = ?e, "Failed to persist vote");
            state.persistent.voted_for = None;
            return refuse(state.current_term());
        }
    }
    state.reset_election_timer();
    tracing::info!(
        id = state.id,
        candidate = req.candidate_id,
        term = req.term,
        "Granted vote"
    );

    RequestVoteResponse {
        term: state.current_term(),
        vote_granted: true,
    }
}
