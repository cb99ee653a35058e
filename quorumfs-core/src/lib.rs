//! Core types and plug-in contracts for QuorumFS.
//!
//! This crate carries the vocabulary shared by the consensus engine and the
//! layers above it: node/term/index identifiers, the command and state
//! machine plug-in traits, and the crate-level error type. The engine itself
//! lives in the `quorumfs` root crate.

pub mod error;
pub mod machine;
pub mod types;

pub use error::*;
pub use machine::*;
pub use types::*;
