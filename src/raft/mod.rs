//! Raft consensus implementation
//!
//! This module implements the Raft consensus algorithm for QuorumFS. It
//! provides strong consistency through leader election, log replication,
//! commit advancement under majority quorum, and snapshot installation for
//! lagging followers, all backed by a crash-safe persistence discipline.

pub mod config;
pub mod log;
pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::*;
pub use log::*;
pub use node::*;
pub use rpc::*;
pub use state::*;
pub use storage::*;

pub use quorumfs_core::{LogIndex, NodeId, Term};

use std::fmt;

/// Role of a replica in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepts log entries from the leader, votes when asked
    Follower,
    /// Attempting to become leader
    Candidate,
    /// Coordinates log replication
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Raft error types
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not leader")]
    NotLeader,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Wire format error: {0}")]
    Codec(#[from] rpc::CodecError),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RaftError> for quorumfs_core::CoreError {
    fn from(err: RaftError) -> Self {
        quorumfs_core::CoreError::consensus(err)
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
