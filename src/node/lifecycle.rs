//! Background loops that live for the whole life of a node.
//!
//! - The election ticker sleeps until the election deadline and starts an
//!   election when nothing reset it in the meantime
//! - The apply worker hands committed entries to the host in log order

use super::{ApplyMsg, Node};
use tokio::sync::mpsc;

impl Node {
    /// Election ticker.
    ///
    /// Raft Algorithm Step 1: Election Timeout Detection
    /// - Followers and candidates wait for a valid AppendEntries or a granted
    ///   vote, both of which push the deadline forward
    /// - If the deadline passes untouched, a new election starts
    pub(super) async fn run_ticker(self) {
        loop {
            if self.killed() {
                break;
            }
            let deadline = {
                let mut state = self.state.lock().await;
                if state.role.is_leader() {
                    // Leaders never time out; wake up periodically anyway to
                    // notice a step-down.
                    state.reset_election_timer();
                }
                state.election_timer.deadline()
            };
            tokio::time::sleep_until(deadline).await;

            if self.killed() {
                break;
            }
            if let Err(e) = self.start_election().await {
                tracing::error!(error = ?e, "Failed to start election");
            }
        }
        tracing::debug!("Election ticker stopped");
    }

    /// Apply worker: waits for the commit index to move (or a snapshot to
    /// land) and delivers everything ready, outside the state lock.
    pub(super) async fn run_apply_loop(
        self,
        apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    ) {
        loop {
            self.apply_signal.notified().await;
            if self.killed() {
                break;
            }
            let ready = self.state.lock().await.take_ready();
            for msg in ready {
                if apply_tx.send(msg).is_err() {
                    tracing::warn!("Apply channel closed, stopping apply worker");
                    return;
                }
            }
        }
        tracing::debug!("Apply worker stopped");
    }
}
