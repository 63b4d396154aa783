//! Inbound RPC handlers. Each one works on the shared
//! `Arc<Mutex<RaftState>>` and needs no running [`super::Node`].

mod append_entries;
mod install_snapshot;
mod vote;

pub use append_entries::handle_append_entries;
pub use install_snapshot::handle_install_snapshot;
pub use vote::handle_request_vote;

#[cfg(test)]
pub(crate) fn test_state(
    id: crate::raft::NodeId,
) -> crate::raft::RaftState {
    crate::raft::RaftState::new(
        id,
        vec![2, 3],
        crate::config::Config::default(),
        std::sync::Arc::new(crate::storage::MemStorage::new()),
    )
}
