//! Role & term state machine and the durable half of a node's state.
//!
//! Everything in [`RaftState`] is guarded by the node's single
//! `tokio::sync::Mutex`; nothing here blocks on the network.

use crate::config::Config;
use crate::log::{Entry, RaftLog};
use crate::node::ApplyMsg;
use crate::storage::{Storage, StorageError};
use crate::watchdog::WatchDog;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;

pub type NodeId = u64;

/// Durable fields, written before any reply or action depends on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
}

/// Durable fields as they stood before a change, so memory can be put back
/// when writing the change out fails.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    persistent: PersistentState,
    snapshot: Bytes,
    pending_snapshot: bool,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

/// Leader-only replication progress, keyed by node identity. The leader's
/// own id is present too and tracks its last log index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    pub next_index: BTreeMap<NodeId, u64>,
    pub match_index: BTreeMap<NodeId, u64>,
}

impl LeaderState {
    pub fn new(members: &[NodeId], last_log_index: u64) -> Self {
        Self {
            next_index: members
                .iter()
                .map(|id| (*id, last_log_index + 1))
                .collect(),
            match_index: members.iter().map(|id| (*id, 0)).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Follower,
    Candidate,
    Leader(LeaderState),
}

impl Role {
    pub fn is_follower(&self) -> bool {
        matches!(self, Role::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Role::Candidate)
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader(_))
    }

    pub fn leader_state(&self) -> Option<&LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        match self {
            Role::Leader(state) => Some(state),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader(_) => "leader",
        }
    }
}

pub struct RaftState {
    pub id: NodeId,
    /// Every other member of the cluster.
    pub peers: Vec<NodeId>,

    pub persistent: PersistentState,
    /// Snapshot bytes matching the log's boundary sentinel.
    pub snapshot: Bytes,

    pub commit_index: u64,
    pub last_applied: u64,
    /// Set when the current snapshot still has to reach the host.
    pub pending_snapshot: bool,

    pub role: Role,
    pub leader_id: Option<NodeId>,
    /// Bumped on every leadership acquisition; replication workers from an
    /// older epoch exit.
    pub epoch: u64,
    pub election_timer: WatchDog,

    pub config: Config,
    pub apply_signal: Arc<Notify>,
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for RaftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftState")
            .field("id", &self.id)
            .field("term", &self.persistent.current_term)
            .field("voted_for", &self.persistent.voted_for)
            .field("role", &self.role.name())
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("snapshot_index", &self.persistent.log.snapshot_index())
            .field("last_log_index", &self.persistent.log.last_index())
            .finish()
    }
}

impl RaftState {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let election_timer = WatchDog::new(config.random_election_timeout());
        Self {
            id,
            peers,
            persistent: PersistentState::default(),
            snapshot: Bytes::new(),
            commit_index: 0,
            last_applied: 0,
            pending_snapshot: false,
            role: Role::Follower,
            leader_id: None,
            epoch: 0,
            election_timer,
            config,
            apply_signal: Arc::new(Notify::new()),
            storage,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn current_term(&self) -> u64 {
        self.persistent.current_term
    }

    pub fn log(&self) -> &RaftLog {
        &self.persistent.log
    }

    pub fn get_last_log_idx(&self) -> u64 {
        self.persistent.log.last_index()
    }

    pub fn get_last_log_term(&self) -> u64 {
        self.persistent.log.last_term()
    }

    fn encode_state(&self) -> Result<Bytes, StorageError> {
        bincode::serialize(&self.persistent)
            .map(Bytes::from)
            .map_err(|e| StorageError::Corrupt(format!("encode state: {e}")))
    }

    /// Writes `{current_term, voted_for, log}` to stable storage.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let state = self.encode_state()?;
        self.storage.save_state(state).await
    }

    /// Writes the state blob together with the snapshot blob describing the
    /// log's current boundary.
    pub async fn persist_with_snapshot(&self) -> Result<(), StorageError> {
        let state = self.encode_state()?;
        let blob = SnapshotBlob {
            last_included_index: self.persistent.log.snapshot_index(),
            last_included_term: self.persistent.log.snapshot_term(),
            data: self.snapshot.clone(),
        };
        let snapshot = bincode::serialize(&blob)
            .map(Bytes::from)
            .map_err(|e| StorageError::Corrupt(format!("encode snapshot: {e}")))?;
        self.storage.save_state_and_snapshot(state, snapshot).await
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            persistent: self.persistent.clone(),
            snapshot: self.snapshot.clone(),
            pending_snapshot: self.pending_snapshot,
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.persistent = checkpoint.persistent;
        self.snapshot = checkpoint.snapshot;
        self.pending_snapshot = checkpoint.pending_snapshot;
    }

    /// Loads persisted state, if any. Must run before timers or RPC
    /// handling start.
    pub async fn restore(&mut self) -> Result<bool, StorageError> {
        let Some(raw) = self.storage.load_state().await? else {
            return Ok(false);
        };
        let persisted: PersistentState = bincode::deserialize(&raw)
            .map_err(|e| StorageError::Corrupt(format!("decode state: {e}")))?;
        let log = RaftLog::from_entries(persisted.log.raw().to_vec())
            .ok_or_else(|| {
                StorageError::Corrupt("log entries are not contiguous".into())
            })?;

        let boundary = log.snapshot_index();
        if boundary > 0 {
            let raw = self.storage.load_snapshot().await?.ok_or_else(|| {
                StorageError::Corrupt(format!(
                    "log starts after {boundary} but no snapshot is stored"
                ))
            })?;
            let blob: SnapshotBlob =
                bincode::deserialize(&raw).map_err(|e| {
                    StorageError::Corrupt(format!("decode snapshot: {e}"))
                })?;
            if blob.last_included_index != boundary
                || blob.last_included_term != log.snapshot_term()
            {
                return Err(StorageError::Corrupt(format!(
                    "snapshot covers {}/{} but log boundary is {}/{}",
                    blob.last_included_index,
                    blob.last_included_term,
                    boundary,
                    log.snapshot_term()
                )));
            }
            self.snapshot = blob.data;
            self.commit_index = boundary;
            self.pending_snapshot = true;
        }

        self.persistent = PersistentState {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            log,
        };
        self.last_applied = 0;
        self.role = Role::Follower;
        Ok(true)
    }

    pub fn reset_election_timer(&mut self) {
        let timeout = self.config.random_election_timeout();
        self.election_timer.reset(timeout);
    }

    /// Steps down to follower. A strictly greater `term` is adopted and the
    /// vote cleared; the caller persists.
    pub fn become_follower(&mut self, term: u64, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
        }
        if !self.role.is_follower() {
            tracing::info!(
                id = self.id,
                term = self.persistent.current_term,
                from = self.role.name(),
                "Stepping down to follower"
            );
        }
        self.role = Role::Follower;
        self.leader_id = leader_id;
    }

    /// Adopts `term` if it is newer than ours. Returns true when state
    /// changed and must be persisted.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term > self.persistent.current_term {
            self.become_follower(term, None);
            return true;
        }
        false
    }

    /// [`Self::observe_term`] followed by a write. If the write fails the
    /// previous term and vote are put back before the error is returned; the
    /// step down to follower stands.
    pub async fn observe_term_durably(&mut self, term: u64) -> Result<bool, StorageError> {
        let (prior_term, prior_vote) =
            (self.persistent.current_term, self.persistent.voted_for);
        if !self.observe_term(term) {
            return Ok(false);
        }
        if let Err(e) = self.persist().await {
            self.persistent.current_term = prior_term;
            self.persistent.voted_for = prior_vote;
            return Err(e);
        }
        Ok(true)
    }

    /// Starts a new term as candidate voting for itself. The caller persists.
    pub fn become_candidate(&mut self) {
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.id);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.reset_election_timer();
        tracing::info!(
            id = self.id,
            term = self.persistent.current_term,
            "Became candidate"
        );
    }

    /// Takes leadership and returns the new replication epoch.
    pub fn become_leader(&mut self) -> u64 {
        let mut members = self.peers.clone();
        members.push(self.id);
        let last_log_index = self.get_last_log_idx();
        let mut leader_state = LeaderState::new(&members, last_log_index);
        leader_state.match_index.insert(self.id, last_log_index);

        self.role = Role::Leader(leader_state);
        self.leader_id = Some(self.id);
        self.epoch += 1;
        tracing::info!(
            id = self.id,
            term = self.persistent.current_term,
            epoch = self.epoch,
            last_log_index,
            "Became leader"
        );
        self.epoch
    }

    /// True when a candidate's log is at least as up to date as ours.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let my_term = self.get_last_log_term();
        if last_log_term != my_term {
            last_log_term > my_term
        } else {
            last_log_index >= self.get_last_log_idx()
        }
    }

    /// Appends a command as leader and returns its index.
    pub fn append_as_leader(&mut self, command: Bytes) -> Option<u64> {
        let term = self.persistent.current_term;
        let id = self.id;
        let leader_state = self.role.leader_state_mut()?;
        let index = self.persistent.log.append(term, command);
        leader_state.match_index.insert(id, index);
        leader_state.next_index.insert(id, index + 1);
        Some(index)
    }

    /// Drops the entry `append_as_leader` just added at `index`, for when it
    /// could not be persisted.
    pub fn retract_leader_append(&mut self, index: u64) {
        self.persistent.log.truncate_from(index);
        let id = self.id;
        if let Some(leader_state) = self.role.leader_state_mut() {
            leader_state.match_index.insert(id, index.saturating_sub(1));
            leader_state.next_index.insert(id, index);
        }
    }

    pub fn set_commit_index(&mut self, index: u64) {
        if index > self.commit_index {
            tracing::debug!(
                id = self.id,
                old_commit_index = self.commit_index,
                new_commit_index = index,
                "Advanced commit index"
            );
            self.commit_index = index;
            self.apply_signal.notify_one();
        }
    }

    /// Leader commit rule: the highest index stored on a strict majority
    /// whose entry belongs to the current term. Returns true if
    /// `commit_index` moved.
    pub fn advance_leader_commit(&mut self) -> bool {
        let Some(leader_state) = self.role.leader_state() else {
            return false;
        };
        let mut matched: Vec<u64> =
            leader_state.match_index.values().copied().collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_position = self.cluster_size() / 2;
        let Some(&candidate) = matched.get(quorum_position) else {
            return false;
        };

        if candidate <= self.commit_index {
            return false;
        }
        if self.persistent.log.term_at(candidate)
            != Some(self.persistent.current_term)
        {
            tracing::trace!(
                id = self.id,
                candidate,
                "Majority index is from an earlier term, not committing"
            );
            return false;
        }
        self.set_commit_index(candidate);
        true
    }

    /// Collects everything the apply loop may deliver now, advancing
    /// `last_applied` in strict order.
    pub fn take_ready(&mut self) -> Vec<ApplyMsg> {
        let mut ready = Vec::new();
        let log = &self.persistent.log;

        if self.pending_snapshot {
            self.pending_snapshot = false;
            if log.snapshot_index() > self.last_applied {
                ready.push(ApplyMsg::Snapshot {
                    term: log.snapshot_term(),
                    index: log.snapshot_index(),
                    data: self.snapshot.clone(),
                });
                self.last_applied = log.snapshot_index();
            }
        }

        // Entries the host folded into its own snapshot are already applied.
        if self.last_applied < log.snapshot_index() {
            self.last_applied = log.snapshot_index();
        }

        while self.last_applied < self.commit_index {
            let Some(Entry { index, command, .. }) =
                log.get(self.last_applied + 1)
            else {
                break;
            };
            ready.push(ApplyMsg::Command {
                index: *index,
                command: command.clone(),
            });
            self.last_applied = *index;
        }
        ready
    }
}

pub fn is_quorum(votes: usize, cluster_size: usize) -> bool {
    votes * 2 > cluster_size
}
