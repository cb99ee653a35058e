//! # QuorumFS Consensus Core
//!
//! The replicated consensus core of a small distributed file system: a
//! generic, log-replicating state-machine replication engine modeled on
//! Raft, parameterized by an application command type and an application
//! state machine. Any number of replicas (typically an odd cluster of 3-7)
//! coordinate to agree on a totally-ordered log of commands; each replica
//! applies committed commands to its local state machine in the same order,
//! yielding linearizable replicated state.
//!
//! ## Architecture
//!
//! - **Core Layer** (`quorumfs-core`): identifiers, plug-in contracts,
//!   error handling
//! - **Consensus Layer** (`raft`): the replica, its durable storage
//!   discipline, and the Raft wire protocol
//! - **Transport Layer** (`transport`): the typed RPC seam the replica
//!   speaks through, with an in-process router for tests
//!
//! The file-system command set, the production RPC transport, and the
//! client-facing FS layer live outside this crate and reach the engine only
//! through the `Command` / `StateMachine` traits and the transport seam.

#![warn(rust_2018_idioms, unused_qualifications)]
#![deny(unsafe_code)]

// Re-export workspace crates
pub use quorumfs_core as core;
pub use quorumfs_core::*;

// Local modules
pub mod raft;
pub mod transport;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
