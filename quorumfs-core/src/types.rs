//! Core type definitions for QuorumFS

/// Identifier of a node in the cluster.
///
/// Nodes are addressed by their position in the static cluster view, so ids
/// are small dense integers rather than generated identifiers.
pub type NodeId = u64;

/// Term number: a monotonically increasing logical epoch. At most one leader
/// exists per term.
pub type Term = u64;

/// Index into the replicated log.
pub type LogIndex = u64;
