//! A single participant in a Raft consensus cluster.
//!
//! The [`node::Node`] handle owns one replica: it elects leaders, replicates
//! an ordered log of opaque commands, persists its durable state through a
//! [`storage::Storage`] backend, compacts the log into snapshots and delivers
//! committed entries to the host service over an [`node::ApplyMsg`] channel.

pub mod config;
pub mod error;
pub mod log;
pub mod network;
pub mod node;
pub mod raft;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod testing;
pub mod trace;
pub mod watchdog;

pub use config::Config;
pub use error::RaftError;
pub use node::{ApplyMsg, Node, NodeStatus};
pub use raft::NodeId;
