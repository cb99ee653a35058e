//! In-process RPC router
//!
//! Routes calls between replicas living in one process, carrying every
//! argument and reply through the same frames a networked transport would:
//! an opcode header on requests, a status code on replies, wire-encoded
//! payloads in between. Links between node groups can be cut and healed to
//! simulate partitions.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::raft::rpc::{
    AppendEntriesArgs, AppendEntriesReply, CodecError, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply, RpcStatus, OP_APPEND_ENTRIES, OP_INSTALL_SNAPSHOT,
    OP_REQUEST_VOTE,
};
use quorumfs_core::{Command, NodeId};

use super::{RaftService, RaftTransport, RpcError, RpcResult};

fn open_request(wire: &mut Bytes, expected: u32) -> RpcResult<()> {
    if wire.remaining() < 4 {
        return Err(RpcError::Codec(CodecError::Truncated));
    }
    let opcode = wire.get_u32();
    if opcode != expected {
        return Err(RpcError::Codec(CodecError::UnknownOpcode(opcode)));
    }
    Ok(())
}

fn open_reply(wire: &mut Bytes) -> RpcResult<()> {
    if wire.remaining() < 4 {
        return Err(RpcError::Codec(CodecError::Truncated));
    }
    let status = RpcStatus::from_u32(wire.get_u32())?;
    if status != RpcStatus::Ok {
        return Err(RpcError::Remote(status));
    }
    Ok(())
}

/// Shared routing table for an in-process cluster.
pub struct LocalRouter<C: Command> {
    services: RwLock<HashMap<NodeId, Arc<dyn RaftService<C>>>>,
    cut: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl<C: Command> LocalRouter<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { services: RwLock::new(HashMap::new()), cut: RwLock::new(HashSet::new()) })
    }

    /// Register the served surface of a node.
    pub fn register(&self, id: NodeId, service: Arc<dyn RaftService<C>>) {
        self.services.write().unwrap().insert(id, service);
    }

    /// Cut every link between the two groups, in both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut cut = self.cut.write().unwrap();
        for &a in left {
            for &b in right {
                cut.insert((a, b));
                cut.insert((b, a));
            }
        }
    }

    /// Cut one node off from every other registered node.
    pub fn isolate(&self, node: NodeId) {
        let others: Vec<NodeId> =
            self.services.read().unwrap().keys().copied().filter(|&id| id != node).collect();
        self.partition(&[node], &others);
    }

    /// Restore full connectivity.
    pub fn heal(&self) {
        self.cut.write().unwrap().clear();
    }

    /// Hand out the client surface for one node.
    pub fn transport(self: &Arc<Self>, from: NodeId) -> LocalTransport<C> {
        LocalTransport { from, router: Arc::clone(self) }
    }

    fn route(&self, from: NodeId, target: NodeId) -> RpcResult<Arc<dyn RaftService<C>>> {
        if self.cut.read().unwrap().contains(&(from, target)) {
            return Err(RpcError::Unreachable(target));
        }
        self.services
            .read()
            .unwrap()
            .get(&target)
            .cloned()
            .ok_or(RpcError::UnknownPeer(target))
    }
}

/// Per-node client handle onto a [`LocalRouter`].
pub struct LocalTransport<C: Command> {
    from: NodeId,
    router: Arc<LocalRouter<C>>,
}

#[async_trait]
impl<C: Command> RaftTransport<C> for LocalTransport<C> {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> RpcResult<RequestVoteReply> {
        let service = self.router.route(self.from, target)?;

        let mut wire = BytesMut::new();
        wire.put_u32(OP_REQUEST_VOTE);
        args.encode(&mut wire);
        let mut wire = wire.freeze();
        open_request(&mut wire, OP_REQUEST_VOTE)?;
        let args = RequestVoteArgs::decode(&mut wire)?;

        let reply = service.request_vote(args).await;

        let mut wire = BytesMut::new();
        wire.put_u32(RpcStatus::Ok as u32);
        reply.encode(&mut wire);
        let mut wire = wire.freeze();
        open_reply(&mut wire)?;
        Ok(RequestVoteReply::decode(&mut wire)?)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs<C>,
    ) -> RpcResult<AppendEntriesReply> {
        let service = self.router.route(self.from, target)?;

        let mut wire = BytesMut::new();
        wire.put_u32(OP_APPEND_ENTRIES);
        args.encode(&mut wire);
        let mut wire = wire.freeze();
        open_request(&mut wire, OP_APPEND_ENTRIES)?;
        let args = AppendEntriesArgs::decode(&mut wire)?;

        let reply = service.append_entries(args).await;

        let mut wire = BytesMut::new();
        wire.put_u32(RpcStatus::Ok as u32);
        reply.encode(&mut wire);
        let mut wire = wire.freeze();
        open_reply(&mut wire)?;
        Ok(AppendEntriesReply::decode(&mut wire)?)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> RpcResult<InstallSnapshotReply> {
        let service = self.router.route(self.from, target)?;

        let mut wire = BytesMut::new();
        wire.put_u32(OP_INSTALL_SNAPSHOT);
        args.encode(&mut wire);
        let mut wire = wire.freeze();
        open_request(&mut wire, OP_INSTALL_SNAPSHOT)?;
        let args = InstallSnapshotArgs::decode(&mut wire)?;

        let reply = service.install_snapshot(args).await;

        let mut wire = BytesMut::new();
        wire.put_u32(RpcStatus::Ok as u32);
        reply.encode(&mut wire);
        let mut wire = wire.freeze();
        open_reply(&mut wire)?;
        Ok(InstallSnapshotReply::decode(&mut wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::LogEntry;
    use crate::raft::testutil::TestCommand;

    /// Replies with its own id as the term.
    struct EchoService {
        id: NodeId,
    }

    #[async_trait]
    impl RaftService<TestCommand> for EchoService {
        async fn request_vote(&self, _args: RequestVoteArgs) -> RequestVoteReply {
            RequestVoteReply { term: self.id, granted: true }
        }

        async fn append_entries(&self, args: AppendEntriesArgs<TestCommand>) -> AppendEntriesReply {
            AppendEntriesReply { term: self.id, success: args.entries.len() == 2 }
        }

        async fn install_snapshot(&self, _args: InstallSnapshotArgs) -> InstallSnapshotReply {
            InstallSnapshotReply { term: self.id }
        }
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs { term: 1, candidate_id: 0, last_log_index: 0, last_log_term: 0 }
    }

    #[tokio::test]
    async fn routes_to_registered_service() {
        let router = LocalRouter::<TestCommand>::new();
        router.register(1, Arc::new(EchoService { id: 1 }));

        let transport = router.transport(0);
        let reply = transport.request_vote(1, vote_args()).await.unwrap();
        assert_eq!(reply.term, 1);
        assert!(reply.granted);
    }

    #[tokio::test]
    async fn entries_survive_the_wire() {
        let router = LocalRouter::<TestCommand>::new();
        router.register(1, Arc::new(EchoService { id: 1 }));

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 0,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![
                LogEntry::new(1, 1, TestCommand(5)),
                LogEntry::new(2, 1, TestCommand(6)),
            ],
            leader_commit: 0,
        };
        let reply = router.transport(0).append_entries(1, args).await.unwrap();
        assert!(reply.success);

        let snapshot = InstallSnapshotArgs {
            term: 1,
            leader_id: 0,
            last_included_index: 3,
            last_included_term: 1,
            snapshot: vec![9, 9, 9],
        };
        let reply = router.transport(0).install_snapshot(1, snapshot).await.unwrap();
        assert_eq!(reply.term, 1);
    }

    #[tokio::test]
    async fn partition_cuts_both_directions() {
        let router = LocalRouter::<TestCommand>::new();
        router.register(0, Arc::new(EchoService { id: 0 }));
        router.register(1, Arc::new(EchoService { id: 1 }));

        router.partition(&[0], &[1]);
        assert!(router.transport(0).request_vote(1, vote_args()).await.is_err());
        assert!(router.transport(1).request_vote(0, vote_args()).await.is_err());

        router.heal();
        assert!(router.transport(0).request_vote(1, vote_args()).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_peer_is_an_error() {
        let router = LocalRouter::<TestCommand>::new();
        let err = router.transport(0).request_vote(9, vote_args()).await.unwrap_err();
        assert!(matches!(err, RpcError::UnknownPeer(9)));
    }
}
