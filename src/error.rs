use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced through the host-facing [`crate::node::Node`] API.
///
/// Protocol outcomes such as stale terms or log mismatches never show up
/// here; they travel inside RPC replies.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("node has been shut down")]
    Shutdown,
}
