//! Typed RPC seam between replicas
//!
//! The engine consumes `RaftTransport` to reach its peers and serves
//! `RaftService` to them. Delivery is unreliable and unordered, duplicates
//! are possible, and calls may hang; the engine tolerates all of this by
//! leaning on its own election timer rather than transport-level timeouts.
//! The production transport lives outside this crate; `local` provides the
//! in-process router the integration tests run on.

pub mod local;

pub use local::*;

use async_trait::async_trait;

use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, CodecError, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply, RpcStatus,
};
use quorumfs_core::{Command, NodeId};

/// Transport-level failures. All of these are transient to the engine: the
/// next tick retries naturally.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    #[error("peer {0} is not registered")]
    UnknownPeer(NodeId),

    #[error("remote returned status {0:?}")]
    Remote(RpcStatus),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// The RPC surface a replica serves.
#[async_trait]
pub trait RaftService<C: Command>: Send + Sync {
    async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;

    async fn append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply;

    async fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply;
}

/// The client surface a replica calls its peers through.
#[async_trait]
pub trait RaftTransport<C: Command>: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> RpcResult<RequestVoteReply>;

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs<C>,
    ) -> RpcResult<AppendEntriesReply>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> RpcResult<InstallSnapshotReply>;
}
