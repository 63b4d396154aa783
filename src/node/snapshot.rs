//! Host-driven log compaction.
//!
//! The host owns snapshot contents; the node only tracks where the log
//! boundary is and keeps the matching bytes so lagging followers can be
//! brought up to date with InstallSnapshot.

use super::Node;
use crate::error::RaftError;
use bytes::Bytes;

impl Node {
    /// Records that the host's state up to and including `index` is captured
    /// in `data`, and discards the log prefix it covers.
    ///
    /// Indices that are already compacted or not yet committed are ignored.
    pub async fn snapshot(
        &self,
        index: u64,
        data: impl Into<Bytes>,
    ) -> Result<(), RaftError> {
        if self.killed() {
            return Err(RaftError::Shutdown);
        }
        let mut state = self.state.lock().await;
        let snapshot_index = state.log().snapshot_index();
        if index <= snapshot_index || index > state.commit_index {
            tracing::debug!(
                index,
                snapshot_index,
                commit_index = state.commit_index,
                "Ignoring snapshot outside the compactable range"
            );
            return Ok(());
        }
        let Some(term) = state.log().term_at(index) else {
            return Ok(());
        };

        let checkpoint = state.checkpoint();
        state.persistent.log.compact_to(index, term);
        state.snapshot = data.into();
        if let Err(e) = state.persist_with_snapshot().await {
            state.rollback(checkpoint);
            return Err(e.into());
        }
        if state.last_applied < index {
            state.last_applied = index;
        }
        tracing::info!(
            index,
            term,
            remaining = state.log().len(),
            "Compacted log into snapshot"
        );
        Ok(())
    }

    /// Called by the host when it receives an `ApplyMsg::Snapshot`. Returns
    /// true when the snapshot describes a committed prefix of this node's
    /// log, so the host may switch to it.
    ///
    /// Snapshots reach the host in log order and InstallSnapshot drops any
    /// that our commit index already covers, so a host that installs every
    /// accepted snapshot never moves backwards. InstallSnapshot also already
    /// trimmed the log and persisted the bytes; nothing is left to do here.
    pub async fn cond_install_snapshot(
        &self,
        last_included_term: u64,
        last_included_index: u64,
        data: &[u8],
    ) -> bool {
        let state = self.state.lock().await;
        let log = state.log();
        let accepted = if last_included_index == log.snapshot_index() {
            log.snapshot_term() == last_included_term
                && state.snapshot.as_ref() == data
        } else if last_included_index < log.snapshot_index() {
            // Superseded by a newer boundary, but still a committed prefix.
            true
        } else {
            last_included_index <= state.commit_index
                && log.term_at(last_included_index) == Some(last_included_term)
        };
        if !accepted {
            tracing::warn!(
                last_included_index,
                last_included_term,
                snapshot_index = log.snapshot_index(),
                commit_index = state.commit_index,
                "Rejecting snapshot that does not match the log"
            );
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{isolated_node, node_with_storage};
    use crate::Config;
    use crate::raft::RaftState;
    use crate::storage::{FailingStorage, MemStorage};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn snapshot_trims_committed_prefix() -> anyhow::Result<()> {
        let (node, _rx) = isolated_node(1, vec![2, 3]).await;
        {
            let mut state = node.state.lock().await;
            for i in 0..5 {
                state.persistent.log.append(1, format!("c{i}").into());
            }
            state.commit_index = 4;
        }
        node.snapshot(3, "upto3").await?;

        let state = node.state.lock().await;
        assert_eq!(state.log().snapshot_index(), 3);
        assert_eq!(state.log().snapshot_term(), 1);
        assert_eq!(state.log().last_index(), 5);
        assert_eq!(state.log().len(), 2);
        assert_eq!(state.snapshot, "upto3");
        assert_eq!(state.last_applied, 3);
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_ignores_uncommitted_and_stale_indices() -> anyhow::Result<()> {
        let (node, _rx) = isolated_node(1, vec![2, 3]).await;
        {
            let mut state = node.state.lock().await;
            for _ in 0..5 {
                state.persistent.log.append(1, "c".into());
            }
            state.commit_index = 2;
        }
        node.snapshot(4, "too far").await?;
        assert_eq!(node.status().await.snapshot_index, 0);

        node.snapshot(2, "ok").await?;
        node.snapshot(1, "stale").await?;
        node.snapshot(2, "again").await?;
        let state = node.state.lock().await;
        assert_eq!(state.log().snapshot_index(), 2);
        assert_eq!(state.snapshot, "ok");
        drop(state);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_persisted_with_state() -> anyhow::Result<()> {
        let storage = MemStorage::new();
        let (node, _rx) =
            node_with_storage(1, vec![2, 3], Arc::new(storage.clone())).await;
        {
            let mut state = node.state.lock().await;
            state.persistent.log.append(1, "a".into());
            state.persistent.log.append(1, "b".into());
            state.commit_index = 2;
        }
        node.snapshot(2, "image").await?;
        node.kill();

        let mut restored =
            RaftState::new(1, vec![2, 3], Config::default(), Arc::new(storage));
        assert!(restored.restore().await?);
        assert_eq!(restored.log().snapshot_index(), 2);
        assert_eq!(restored.snapshot, "image");
        assert_eq!(restored.commit_index, 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_snapshot_write_keeps_log() -> anyhow::Result<()> {
        let storage = Arc::new(FailingStorage::default());
        let (node, _rx) = node_with_storage(1, vec![2, 3], storage.clone()).await;
        {
            let mut state = node.state.lock().await;
            for i in 0..3 {
                state.persistent.log.append(1, format!("c{i}").into());
            }
            state.commit_index = 3;
        }
        storage.set_failing(true);
        assert!(node.snapshot(2, "image").await.is_err());
        {
            let state = node.state.lock().await;
            assert_eq!(state.log().snapshot_index(), 0);
            assert_eq!(state.log().len(), 3);
            assert!(state.snapshot.is_empty());
        }

        storage.set_failing(false);
        node.snapshot(2, "image").await?;
        assert_eq!(node.status().await.snapshot_index, 2);
        node.kill();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cond_install_accepts_committed_prefixes_only() -> anyhow::Result<()> {
        let (node, _rx) = isolated_node(1, vec![2, 3]).await;
        {
            let mut state = node.state.lock().await;
            state.persistent.log.compact_to(10, 3);
            state.snapshot = "image".into();
            state.commit_index = 10;
        }
        assert!(node.cond_install_snapshot(3, 10, b"image").await);
        assert!(node.cond_install_snapshot(2, 8, b"older").await);
        assert!(!node.cond_install_snapshot(2, 10, b"image").await);
        assert!(!node.cond_install_snapshot(3, 10, b"other").await);
        assert!(!node.cond_install_snapshot(3, 12, b"ahead").await);
        node.kill();
        assert!(node.snapshot(10, "x").await.is_err());
        Ok(())
    }
}
