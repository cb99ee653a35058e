//! Common test utilities and helpers

use std::sync::Arc;
use std::time::Duration;

use quorumfs::raft::{MemoryStorage, RaftConfig, RaftNode};
use quorumfs::transport::LocalRouter;
use quorumfs::{Command, NodeId, StateMachine};

/// A fixed-width numeric command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqCommand(pub u64);

impl Command for SeqCommand {
    fn size(&self) -> usize {
        8
    }

    fn serialize(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.0.to_be_bytes());
    }

    fn deserialize(buf: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Self(u64::from_be_bytes(raw))
    }
}

/// Records every applied command, in order.
#[derive(Debug, Default)]
pub struct SeqMachine {
    pub applied: Vec<u64>,
}

impl StateMachine for SeqMachine {
    type Command = SeqCommand;

    fn apply(&mut self, cmd: &SeqCommand) {
        self.applied.push(cmd.0);
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.applied).unwrap()
    }

    fn apply_snapshot(&mut self, bytes: &[u8]) {
        self.applied = bincode::deserialize(bytes).unwrap();
    }
}

/// An in-process cluster over a [`LocalRouter`], one memory store per node
/// so crashed replicas can restart from their durable state.
pub struct TestCluster {
    pub router: Arc<LocalRouter<SeqCommand>>,
    pub nodes: Vec<Arc<RaftNode<SeqMachine>>>,
    pub storages: Vec<MemoryStorage<SeqCommand>>,
}

impl TestCluster {
    pub async fn launch(size: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let router = LocalRouter::new();
        let ids: Vec<NodeId> = (0..size as NodeId).collect();
        let mut nodes = Vec::new();
        let mut storages = Vec::new();

        for &id in &ids {
            let storage = MemoryStorage::new();
            let node = RaftNode::new(
                id,
                ids.clone(),
                RaftConfig::default(),
                Arc::new(router.transport(id)),
                Arc::new(storage.clone()),
                SeqMachine::default(),
            )
            .await
            .unwrap();
            router.register(id, node.clone());
            node.start().await;
            nodes.push(node);
            storages.push(storage);
        }

        Self { router, nodes, storages }
    }

    pub fn node(&self, id: NodeId) -> &Arc<RaftNode<SeqMachine>> {
        &self.nodes[id as usize]
    }

    /// Wait until exactly one node outside `exclude` claims leadership,
    /// stably across two samples, and return its id.
    pub async fn wait_for_leader(&self, exclude: &[NodeId]) -> NodeId {
        let mut previous: Option<NodeId> = None;
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(25)).await;

            let mut leaders = Vec::new();
            for node in &self.nodes {
                if exclude.contains(&node.id()) {
                    continue;
                }
                let (is_leader, _) = node.is_leader().await;
                if is_leader {
                    leaders.push(node.id());
                }
            }

            if leaders.len() == 1 {
                if previous == Some(leaders[0]) {
                    return leaders[0];
                }
                previous = Some(leaders[0]);
            } else {
                previous = None;
            }
        }
        panic!("no stable leader within the deadline");
    }

    pub async fn applied(&self, id: NodeId) -> Vec<u64> {
        self.node(id).read_machine(|machine| machine.applied.clone()).await
    }

    /// Wait until the machine on `id` has applied exactly `expect`.
    pub async fn wait_applied(&self, id: NodeId, expect: &[u64]) {
        for _ in 0..400 {
            if self.applied(id).await == expect {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!(
            "node {} applied {:?}, expected {:?}",
            id,
            self.applied(id).await,
            expect
        );
    }

    /// Simulate a crash: cut the node off and stop it. Its durable state
    /// stays behind in `storages`.
    pub async fn crash(&self, id: NodeId) {
        self.router.isolate(id);
        self.node(id).stop().await;
    }

    /// Bring a crashed node back from its durable state. The caller heals
    /// the partition when ready.
    pub async fn restart(&mut self, id: NodeId) {
        let node = RaftNode::new(
            id,
            (0..self.nodes.len() as NodeId).collect(),
            RaftConfig::default(),
            Arc::new(self.router.transport(id)),
            Arc::new(self.storages[id as usize].clone()),
            SeqMachine::default(),
        )
        .await
        .unwrap();
        self.router.register(id, node.clone());
        node.start().await;
        self.nodes[id as usize] = node;
    }

    pub async fn stop_all(&self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}
