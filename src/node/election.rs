//! Leader election logic.
//!
//! Implements Raft leader election (§5.2) including:
//! - Vote collection from peers
//! - Majority calculation
//! - State transitions (follower ↔ candidate ↔ leader)

use super::Node;
use crate::raft::{NodeId, is_quorum};
use crate::rpc::*;
use crate::trace::rpc_context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

type VoteResult = (NodeId, anyhow::Result<RequestVoteResponse>);

impl Node {
    /// Initiates an election by requesting votes from all peers.
    ///
    /// Raft Algorithm - Leader Election Step 2:
    /// Candidate increments its term, votes for itself, persists, and sends
    /// RequestVote RPC to all other nodes in parallel. Vote counting runs in
    /// its own task so the ticker can start the next election on time.
    pub(super) async fn start_election(&self) -> anyhow::Result<()> {
        let req = {
            let mut state = self.state.lock().await;
            // The deadline may have been pushed while we were asleep.
            if state.role.is_leader() || !state.election_timer.expired() {
                return Ok(());
            }
            let prior = (state.persistent.current_term, state.persistent.voted_for);
            state.become_candidate();
            if let Err(e) = state.persist().await {
                (state.persistent.current_term, state.persistent.voted_for) = prior;
                state.become_follower(prior.0, None);
                return Err(e.into());
            }

            if state.peers.is_empty() {
                let epoch = state.become_leader();
                drop(state);
                self.spawn_replicators(epoch);
                return Ok(());
            }

            RequestVoteRequest {
                term: state.current_term(),
                candidate_id: state.id,
                last_log_index: state.get_last_log_idx(),
                last_log_term: state.get_last_log_term(),
            }
        };

        tracing::info!(
            candidate_id = req.candidate_id,
            term = req.term,
            peer_count = self.peers.len(),
            "sending request_vote to peers"
        );

        let (tx, rx) = mpsc::channel(self.peers.len().max(1));
        for (&peer, client) in self.peers.iter() {
            let tx = tx.clone();
            let client = Arc::clone(client);
            let req = req.clone();
            let rpc_timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                let result =
                    Self::send_request_vote(peer, client, req, rpc_timeout).await;
                let _ = tx.send((peer, result)).await;
            });
        }
        drop(tx);

        let span = tracing::info_span!("election", term = req.term);
        tokio::spawn(self.clone().collect_votes(req.term, rx).instrument(span));
        Ok(())
    }

    /// Processes vote replies for one election.
    ///
    /// Raft Algorithm - Leader Election Steps 3-4:
    /// The candidate becomes leader once a strict majority (itself included)
    /// granted. It gives up on a newer term, on losing candidacy, when a
    /// majority can no longer be reached, or when the election window passes.
    async fn collect_votes(self, term: u64, mut rx: mpsc::Receiver<VoteResult>) {
        let cluster_size = self.peers_len() + 1;
        let mut granted = 1;
        let mut outstanding = cluster_size - 1;

        let window = tokio::time::sleep(self.config.election_timeout_max);
        tokio::pin!(window);

        while outstanding > 0 {
            let (peer, result) = tokio::select! {
                vote = rx.recv() => match vote {
                    Some(vote) => vote,
                    None => return,
                },
                _ = &mut window => {
                    tracing::debug!(granted, outstanding, "Election window passed");
                    return;
                }
            };
            outstanding -= 1;

            let mut state = self.state.lock().await;
            match result {
                Ok(resp) => {
                    match state.observe_term_durably(resp.term).await {
                        Ok(true) => {
                            tracing::info!(
                                peer,
                                term = resp.term,
                                "newer term was discovered"
                            );
                            return;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::error!(error = ?e, "Failed to persist term");
                            return;
                        }
                    }
                    if resp.vote_granted {
                        granted += 1;
                        tracing::debug!(peer, granted, "Vote granted");
                    }
                }
                Err(e) => {
                    tracing::debug!(peer, error = ?e, "RequestVote failed");
                }
            }

            if state.current_term() != term || !state.role.is_candidate() {
                tracing::debug!("No longer a candidate for this term");
                return;
            }
            if is_quorum(granted, cluster_size) {
                tracing::info!(granted, cluster_size, "vote granted, become leader");
                let epoch = state.become_leader();
                drop(state);
                self.spawn_replicators(epoch);
                return;
            }
            if !is_quorum(granted + outstanding, cluster_size) {
                tracing::info!(granted, cluster_size, "Election lost");
                return;
            }
        }
    }

    fn peers_len(&self) -> usize {
        self.replicate_signals.len()
    }

    /// Sends RequestVote RPC to a single peer.
    async fn send_request_vote(
        peer: NodeId,
        client: Arc<dyn RaftRpcTrait>,
        req: RequestVoteRequest,
        rpc_timeout: Duration,
    ) -> anyhow::Result<RequestVoteResponse> {
        let ctx = rpc_context(rpc_timeout);
        let call = client
            .request_vote(ctx, req)
            .instrument(tracing::debug_span!("request_vote", peer));
        tokio::time::timeout(rpc_timeout, call)
            .await
            .map_err(|_| anyhow::anyhow!("request_vote to {peer} timed out"))?
    }
}
