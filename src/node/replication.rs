//! Log replication and commit index management.
//!
//! Implements Raft log replication (§5.3) including:
//! - One replication worker per follower for the lifetime of a leadership
//! - next_index/match_index tracking from AppendEntries replies
//! - Falling back to InstallSnapshot when a follower needs compacted entries
//! - Commit index advancement based on majority replication

use super::Node;
use crate::raft::NodeId;
use crate::rpc::*;
use crate::trace::rpc_context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::Instrument;

enum Outbound {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

/// What a worker does after handling a reply.
#[derive(Debug, PartialEq, Eq)]
enum Progress {
    /// The follower still lags; send again right away.
    Behind,
    /// Caught up (or unreachable); wait for new entries or the heartbeat.
    Idle,
    /// Leadership for this epoch is over.
    Stop,
}

impl Node {
    pub(super) fn spawn_replicators(&self, epoch: u64) {
        for &peer in self.peers.keys() {
            let span = tracing::info_span!("replicate", peer, epoch);
            tokio::spawn(self.clone().replicate_to(peer, epoch).instrument(span));
        }
    }

    /// Replication worker for one follower.
    ///
    /// Raft Algorithm - Log Replication Steps 3-7:
    /// The leader sends AppendEntries (empty ones double as heartbeats),
    /// receives acks, and retries with an earlier next_index on mismatch.
    /// The first send happens immediately so a new leader asserts itself.
    async fn replicate_to(self, peer: NodeId, epoch: u64) {
        let (Some(client), Some(signal)) = (
            self.peers.get(&peer).cloned(),
            self.replicate_signals.get(&peer).cloned(),
        ) else {
            return;
        };
        let rpc_timeout = self.config.rpc_timeout;

        loop {
            if self.killed() {
                break;
            }
            let Some(outbound) = self.next_outbound(peer, epoch).await else {
                break;
            };
            let progress = match outbound {
                Outbound::Append(req) => {
                    match Self::send_append_entries(&client, req.clone(), rpc_timeout)
                        .await
                    {
                        Ok(resp) => self.handle_append_reply(peer, epoch, &req, resp).await,
                        Err(e) => {
                            tracing::debug!(error = ?e, "AppendEntries failed");
                            Progress::Idle
                        }
                    }
                }
                Outbound::Snapshot(req) => {
                    match Self::send_install_snapshot(&client, req.clone(), rpc_timeout)
                        .await
                    {
                        Ok(resp) => {
                            self.handle_snapshot_reply(peer, epoch, &req, resp).await
                        }
                        Err(e) => {
                            tracing::debug!(error = ?e, "InstallSnapshot failed");
                            Progress::Idle
                        }
                    }
                }
            };

            match progress {
                Progress::Stop => break,
                Progress::Behind => continue,
                Progress::Idle => {
                    if !self.idle(&signal, epoch).await {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Replication worker stopped");
    }

    /// Waits for new entries or the next heartbeat. Returns false once
    /// `epoch` is over.
    ///
    /// Workers of consecutive leaderships share the peer's signal. A wakeup
    /// taken by a worker whose epoch has ended was meant for its successor
    /// and is passed on.
    async fn idle(&self, signal: &Notify, epoch: u64) -> bool {
        let woken = tokio::select! {
            _ = signal.notified() => true,
            _ = tokio::time::sleep(self.config.heartbeat_interval) => false,
        };
        let current = self.state.lock().await.epoch == epoch;
        if !current && woken {
            signal.notify_one();
        }
        current
    }

    /// Builds the next request for `peer` from the leader's view of its
    /// progress, or `None` once this leadership epoch has ended.
    async fn next_outbound(&self, peer: NodeId, epoch: u64) -> Option<Outbound> {
        let state = self.state.lock().await;
        if state.epoch != epoch {
            return None;
        }
        let leader_state = state.role.leader_state()?;
        let log = state.log();
        let next_index = leader_state
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(log.last_index() + 1)
            .min(log.last_index() + 1);

        if next_index <= log.snapshot_index() {
            tracing::debug!(
                next_index,
                snapshot_index = log.snapshot_index(),
                "next_index points to compacted log, sending snapshot"
            );
            return Some(Outbound::Snapshot(InstallSnapshotRequest {
                term: state.current_term(),
                leader_id: state.id,
                last_included_index: log.snapshot_index(),
                last_included_term: log.snapshot_term(),
                data: state.snapshot.clone(),
            }));
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = log.term_at(prev_log_index)?;
        Some(Outbound::Append(AppendEntriesRequest {
            term: state.current_term(),
            leader_id: state.id,
            prev_log_index,
            prev_log_term,
            entries: log.entries_from(next_index, self.config.max_entries_per_rpc),
            leader_commit: state.commit_index,
        }))
    }

    /// Applies an AppendEntries reply to the leader's bookkeeping.
    ///
    /// Raft Algorithm - Log Replication Steps 8-9:
    /// On success match_index/next_index advance and the commit index is
    /// recomputed; on failure next_index backs off using the conflict hint.
    async fn handle_append_reply(
        &self,
        peer: NodeId,
        epoch: u64,
        req: &AppendEntriesRequest,
        resp: AppendEntriesResponse,
    ) -> Progress {
        let mut state = self.state.lock().await;
        match state.observe_term_durably(resp.term).await {
            Ok(true) => {
                tracing::info!(term = resp.term, "Follower has newer term, stepping down");
                return Progress::Stop;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = ?e, "Failed to persist term");
                return Progress::Stop;
            }
        }
        // Replies from an older leadership must not touch the current one.
        if state.epoch != epoch
            || state.current_term() != req.term
            || !state.role.is_leader()
        {
            return Progress::Stop;
        }

        let last_index = state.get_last_log_idx();
        if resp.success {
            let matched = req.prev_log_index + req.entries.len() as u64;
            let Some(leader_state) = state.role.leader_state_mut() else {
                return Progress::Stop;
            };
            let match_index = leader_state.match_index.entry(peer).or_insert(0);
            if matched > *match_index {
                *match_index = matched;
            }
            let next_index = *match_index + 1;
            leader_state.next_index.insert(peer, next_index);
            state.advance_leader_commit();

            if next_index <= last_index {
                Progress::Behind
            } else {
                Progress::Idle
            }
        } else {
            let log = state.log();
            let hinted = match (resp.conflict_term, resp.conflict_index) {
                (Some(term), Some(index)) => Some(
                    log.last_index_of_term(term)
                        .map(|last| last + 1)
                        .unwrap_or(index),
                ),
                (None, Some(index)) => Some(index),
                _ => None,
            };
            let next_index = hinted
                .unwrap_or(req.prev_log_index)
                .clamp(1, req.prev_log_index.max(1));
            tracing::debug!(
                prev_log_index = req.prev_log_index,
                conflict_term = ?resp.conflict_term,
                conflict_index = ?resp.conflict_index,
                next_index,
                "Log mismatch, backing off"
            );
            if let Some(leader_state) = state.role.leader_state_mut() {
                leader_state.next_index.insert(peer, next_index);
            }
            // Without a hint the follower may be failing on its side.
            if hinted.is_some() {
                Progress::Behind
            } else {
                Progress::Idle
            }
        }
    }

    async fn handle_snapshot_reply(
        &self,
        peer: NodeId,
        epoch: u64,
        req: &InstallSnapshotRequest,
        resp: InstallSnapshotResponse,
    ) -> Progress {
        let mut state = self.state.lock().await;
        match state.observe_term_durably(resp.term).await {
            Ok(true) => {
                tracing::info!(term = resp.term, "Follower has newer term, stepping down");
                return Progress::Stop;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(error = ?e, "Failed to persist term");
                return Progress::Stop;
            }
        }
        if state.epoch != epoch
            || state.current_term() != req.term
            || !state.role.is_leader()
        {
            return Progress::Stop;
        }

        let last_index = state.get_last_log_idx();
        let Some(leader_state) = state.role.leader_state_mut() else {
            return Progress::Stop;
        };
        let match_index = leader_state.match_index.entry(peer).or_insert(0);
        if req.last_included_index > *match_index {
            *match_index = req.last_included_index;
        }
        let next_index = *match_index + 1;
        leader_state.next_index.insert(peer, next_index);
        tracing::info!(
            last_included_index = req.last_included_index,
            "Follower installed snapshot"
        );
        state.advance_leader_commit();

        if next_index <= last_index {
            Progress::Behind
        } else {
            Progress::Idle
        }
    }

    async fn send_append_entries(
        client: &Arc<dyn RaftRpcTrait>,
        req: AppendEntriesRequest,
        rpc_timeout: Duration,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let ctx = rpc_context(rpc_timeout);
        tokio::time::timeout(rpc_timeout, client.append_entries(ctx, req))
            .await
            .map_err(|_| anyhow::anyhow!("append_entries timed out"))?
    }

    async fn send_install_snapshot(
        client: &Arc<dyn RaftRpcTrait>,
        req: InstallSnapshotRequest,
        rpc_timeout: Duration,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        let ctx = rpc_context(rpc_timeout);
        tokio::time::timeout(rpc_timeout, client.install_snapshot(ctx, req))
            .await
            .map_err(|_| anyhow::anyhow!("install_snapshot timed out"))?
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::isolated_node;
    use super::*;
    use crate::log::Entry;
    use bytes::Bytes;

    async fn leader_with_log(terms: &[u64]) -> (Node, u64) {
        let (node, _rx) = isolated_node(1, vec![2, 3]).await;
        let mut state = node.state.lock().await;
        for &term in terms {
            state.persistent.log.append(term, Bytes::from("x"));
        }
        state.persistent.current_term = terms.last().copied().unwrap_or(0);
        state.become_candidate();
        let epoch = state.become_leader();
        drop(state);
        (node, epoch)
    }

    fn append_req(term: u64, prev_log_index: u64, n: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 1,
            prev_log_index,
            prev_log_term: 0,
            entries: (1..=n)
                .map(|i| Entry {
                    index: prev_log_index + i,
                    term,
                    command: Bytes::new(),
                })
                .collect(),
            leader_commit: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_advances_match_and_commit() -> anyhow::Result<()> {
        let (node, epoch) = leader_with_log(&[1, 1]).await;
        let term = node.state.lock().await.current_term();
        node.state.lock().await.append_as_leader(Bytes::from("new"));

        let resp = AppendEntriesResponse {
            term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        };
        let progress = node
            .handle_append_reply(2, epoch, &append_req(term, 0, 3), resp)
            .await;
        assert_eq!(progress, Progress::Idle);

        let state = node.state.lock().await;
        let leader = state.role.leader_state().unwrap();
        assert_eq!(leader.match_index[&2], 3);
        assert_eq!(leader.next_index[&2], 4);
        assert_eq!(state.commit_index, 3);
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_term_skips_whole_term() -> anyhow::Result<()> {
        // Leader log terms: 1 1 1 4 4 5 5
        let (node, epoch) = leader_with_log(&[1, 1, 1, 4, 4, 5, 5]).await;
        let term = node.state.lock().await.current_term();

        // Follower holds term 4 at index 6 (prev), first index of that run 4.
        let resp = AppendEntriesResponse {
            term,
            success: false,
            conflict_term: Some(4),
            conflict_index: Some(4),
        };
        let progress = node
            .handle_append_reply(2, epoch, &append_req(term, 6, 0), resp)
            .await;
        assert_eq!(progress, Progress::Behind);
        let state = node.state.lock().await;
        // Leader has term 4 ending at index 5.
        assert_eq!(state.role.leader_state().unwrap().next_index[&2], 6);
        drop(state);

        // Unknown term: fall back to the follower's first index of it.
        let resp = AppendEntriesResponse {
            term,
            success: false,
            conflict_term: Some(2),
            conflict_index: Some(2),
        };
        node.handle_append_reply(3, epoch, &append_req(term, 5, 0), resp)
            .await;
        let state = node.state.lock().await;
        assert_eq!(state.role.leader_state().unwrap().next_index[&3], 2);
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn short_follower_log_jumps_to_its_end() -> anyhow::Result<()> {
        let (node, epoch) = leader_with_log(&[1, 1, 1, 1]).await;
        let term = node.state.lock().await.current_term();
        let resp = AppendEntriesResponse {
            term,
            success: false,
            conflict_term: None,
            conflict_index: Some(2),
        };
        node.handle_append_reply(2, epoch, &append_req(term, 4, 0), resp)
            .await;
        let state = node.state.lock().await;
        assert_eq!(state.role.leader_state().unwrap().next_index[&2], 2);
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn higher_term_reply_steps_down() -> anyhow::Result<()> {
        let (node, epoch) = leader_with_log(&[1]).await;
        let term = node.state.lock().await.current_term();
        let resp = AppendEntriesResponse::reject(term + 3);
        let progress = node
            .handle_append_reply(2, epoch, &append_req(term, 1, 0), resp)
            .await;
        assert_eq!(progress, Progress::Stop);
        let status = node.status().await;
        assert_eq!(status.role, "follower");
        assert_eq!(status.term, term + 3);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_worker_passes_wakeup_to_successor() -> anyhow::Result<()> {
        let (node, old_epoch) = leader_with_log(&[1]).await;
        let signal = Arc::clone(&node.replicate_signals[&2]);
        let waiting = tokio::spawn({
            let node = node.clone();
            let signal = Arc::clone(&signal);
            async move { node.idle(&signal, old_epoch).await }
        });
        tokio::task::yield_now().await;

        // A new leadership begins while the old worker is still waiting.
        let new_epoch = node.state.lock().await.become_leader();
        assert_ne!(new_epoch, old_epoch);
        signal.notify_one();
        assert!(!waiting.await?);

        // The successor still sees the wakeup instead of sleeping a heartbeat.
        tokio::time::timeout(Duration::from_millis(1), signal.notified()).await?;
        assert!(node.idle(&signal, new_epoch).await);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_epoch_reply_is_ignored() -> anyhow::Result<()> {
        let (node, epoch) = leader_with_log(&[1, 1]).await;
        let term = node.state.lock().await.current_term();
        let resp = AppendEntriesResponse {
            term,
            success: true,
            conflict_term: None,
            conflict_index: None,
        };
        let progress = node
            .handle_append_reply(2, epoch + 1, &append_req(term, 0, 2), resp)
            .await;
        assert_eq!(progress, Progress::Stop);
        let state = node.state.lock().await;
        assert_eq!(state.role.leader_state().unwrap().match_index[&2], 0);
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_peer_gets_snapshot() -> anyhow::Result<()> {
        let (node, epoch) = leader_with_log(&[1, 1, 1]).await;
        {
            let mut state = node.state.lock().await;
            state.commit_index = 2;
            state.persistent.log.compact_to(2, 1);
            state.snapshot = Bytes::from("image");
            let leader = state.role.leader_state_mut().unwrap();
            leader.next_index.insert(2, 1);
        }
        let Some(Outbound::Snapshot(req)) = node.next_outbound(2, epoch).await else {
            panic!("expected InstallSnapshot");
        };
        assert_eq!(req.last_included_index, 2);
        assert_eq!(req.data, Bytes::from("image"));

        let term = req.term;
        let progress = node
            .handle_snapshot_reply(2, epoch, &req, InstallSnapshotResponse { term })
            .await;
        assert_eq!(progress, Progress::Behind);
        let Some(Outbound::Append(next)) = node.next_outbound(2, epoch).await else {
            panic!("expected AppendEntries");
        };
        assert_eq!(next.prev_log_index, 2);
        assert_eq!(next.entries.len(), 1);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_capped() -> anyhow::Result<()> {
        let terms = vec![1; 300];
        let (node, epoch) = leader_with_log(&terms).await;
        node.state
            .lock()
            .await
            .role
            .leader_state_mut()
            .unwrap()
            .next_index
            .insert(2, 1);
        let Some(Outbound::Append(req)) = node.next_outbound(2, epoch).await else {
            panic!("expected AppendEntries");
        };
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.entries.len(), node.config.max_entries_per_rpc);
        assert!(node.next_outbound(2, epoch + 1).await.is_none());
        node.kill();
        Ok(())
    }
}
