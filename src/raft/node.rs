//! The replica
//!
//! One `RaftNode` runs per cluster member. A single mutex guards the whole
//! replica state; RPC handlers, public methods, and the four background
//! activities (election timer, heartbeater, replicator, applier) all take
//! it. Outgoing RPCs are prepared under the lock, sent without it, and
//! their replies are processed under a fresh lock, so the lock is never
//! held across a tick sleep or a wire call.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use quorumfs_core::{LogIndex, NodeId, StateMachine, Term};

use super::config::RaftConfig;
use super::log::ReplicatedLog;
use super::rpc::{
    AppendEntriesArgs, AppendEntriesReply, InstallSnapshotArgs, InstallSnapshotReply, LogEntry,
    RequestVoteArgs, RequestVoteReply,
};
use super::state::{LeaderProgress, VoteTally};
use super::storage::RaftStorage;
use super::{Result, Role};
use crate::transport::{RaftService, RaftTransport};

/// Point-in-time view of a replica, for observation and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub log_base: LogIndex,
}

/// Everything the replica mutex guards.
struct RaftCore<M: StateMachine> {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: ReplicatedLog<M::Command>,
    snapshot: Vec<u8>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    machine: M,

    /// Candidate-only: vote grants gathered this term
    tally: VoteTally,

    /// Leader-only: follower progress and the commit tally
    progress: Option<LeaderProgress>,

    /// Last moment a valid leader or a granted vote was observed
    last_heard: Instant,
    follower_timeout: Duration,
    candidate_timeout: Duration,
    rng: StdRng,
}

impl<M: StateMachine> RaftCore<M> {
    fn rearm_timers(&mut self, config: &RaftConfig) {
        self.follower_timeout = config.draw_follower_timeout(&mut self.rng);
        self.candidate_timeout = config.draw_candidate_timeout(&mut self.rng);
    }

    /// Fall back to follower. The vote is cleared only when the term
    /// advances; a candidate stepping down within its own term keeps its
    /// self-vote, so it can never grant a second one. Returns whether the
    /// metadata needs persisting.
    fn step_down(&mut self, term: Term, config: &RaftConfig) -> bool {
        let new_term = term > self.current_term;
        if new_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = Role::Follower;
        self.progress = None;
        self.rearm_timers(config);
        new_term
    }
}

/// A replicated state machine member.
///
/// Created around a storage handle and a transport; restore happens in
/// [`RaftNode::new`], the background activities in [`RaftNode::start`].
pub struct RaftNode<M: StateMachine> {
    id: NodeId,
    cluster: Vec<NodeId>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport<M::Command>>,
    storage: Arc<dyn RaftStorage<M::Command>>,
    core: Mutex<RaftCore<M>>,
    stopped: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: StateMachine> RaftNode<M> {
    /// Restore a replica from storage, or initialize a fresh one (term 0,
    /// no vote, sentinel log, empty snapshot) and write that state back
    /// durably. A restored snapshot is applied to the state machine here,
    /// before anything else can observe it.
    pub async fn new(
        id: NodeId,
        cluster: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport<M::Command>>,
        storage: Arc<dyn RaftStorage<M::Command>>,
        mut machine: M,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (current_term, voted_for, log, snapshot) = match storage.restore().await? {
            Some(state) => (
                state.current_term,
                state.voted_for,
                ReplicatedLog::from_entries(state.log),
                state.snapshot,
            ),
            None => {
                let log = ReplicatedLog::new();
                storage.update_metadata(0, None).await?;
                storage.update_log(log.entries()).await?;
                storage.update_snapshot(&[]).await?;
                (0, None, log, Vec::new())
            }
        };

        if !snapshot.is_empty() {
            machine.apply_snapshot(&snapshot);
        }

        let base = log.base();
        let mut rng = StdRng::from_entropy();
        let follower_timeout = config.draw_follower_timeout(&mut rng);
        let candidate_timeout = config.draw_candidate_timeout(&mut rng);

        info!(node = id, term = current_term, base, "replica ready");

        Ok(Arc::new(Self {
            id,
            cluster,
            config,
            transport,
            storage,
            core: Mutex::new(RaftCore {
                role: Role::Follower,
                current_term,
                voted_for,
                log,
                snapshot,
                commit_index: base,
                last_applied: base,
                machine,
                tally: VoteTally::default(),
                progress: None,
                last_heard: Instant::now(),
                follower_timeout,
                candidate_timeout,
                rng,
            }),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Spawn the background activities. The node must already be
    /// registered with the RPC server: peers may call in immediately.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(Arc::clone(self).run_election_timer()));
        workers.push(tokio::spawn(Arc::clone(self).run_heartbeater()));
        workers.push(tokio::spawn(Arc::clone(self).run_replicator()));
        workers.push(tokio::spawn(Arc::clone(self).run_applier()));
    }

    /// Stop the replica and join every background activity. Outstanding
    /// RPCs may still complete; their replies short-circuit on the stop
    /// flag.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
        info!(node = self.id, "replica stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether this replica currently leads, and its term.
    pub async fn is_leader(&self) -> (bool, Term) {
        let core = self.core.lock().await;
        (core.role == Role::Leader, core.current_term)
    }

    /// Observational snapshot of the replica.
    pub async fn status(&self) -> RaftStatus {
        let core = self.core.lock().await;
        RaftStatus {
            role: core.role,
            term: core.current_term,
            commit_index: core.commit_index,
            last_applied: core.last_applied,
            last_log_index: core.log.last_index(),
            log_base: core.log.base(),
        }
    }

    /// Inspect the state machine under the replica lock.
    pub async fn read_machine<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        let core = self.core.lock().await;
        f(&core.machine)
    }

    /// Append a command to the log if this replica currently leads.
    ///
    /// Returns the assigned `(term, index)`. The entry is not yet
    /// committed and no delivery promise is made; clients observe the
    /// command, if it survives, through the state machine.
    pub async fn submit(&self, cmd: M::Command) -> Option<(Term, LogIndex)> {
        let mut core = self.core.lock().await;
        if core.role != Role::Leader {
            return None;
        }

        let term = core.current_term;
        let index = core.log.last_index() + 1;
        let entry = LogEntry::new(index, term, cmd);
        core.log.append(entry.clone());
        if let Some(progress) = core.progress.as_mut() {
            progress.record_local_append(self.id, index);
        }

        let new_len = core.log.entries().len();
        self.persist_append(&core, std::slice::from_ref(&entry), new_len).await;

        // a single-replica cluster reaches majority right here
        self.advance_commit(&mut core);

        debug!(node = self.id, term, index, "command accepted");
        Some((term, index))
    }

    /// Replace the log prefix up to `last_applied` with a state machine
    /// snapshot. The boundary entry stays behind as the new base sentinel.
    pub async fn save_snapshot(&self) {
        let mut core = self.core.lock().await;
        let boundary = core.last_applied;
        let snapshot = core.machine.snapshot();
        core.snapshot = snapshot;
        core.log.compact_to(boundary);

        self.persist_snapshot(&core.snapshot).await;
        self.persist_log(&core).await;
        info!(node = self.id, term = core.current_term, boundary, "log compacted into snapshot");
    }

    // ---- persistence helpers ----
    //
    // Metadata persistence happens-before granting a vote or broadcasting
    // from a new candidate term; log persistence happens-before reporting
    // AppendEntries success. A failed append falls back to a full rewrite;
    // a failed rewrite or metadata write panics the replica, which restarts
    // from durable state.

    async fn persist_metadata(&self, term: Term, voted_for: Option<NodeId>) {
        if let Err(err) = self.storage.update_metadata(term, voted_for).await {
            error!(node = self.id, %err, "metadata persist failed");
            panic!("raft storage failure: {err}");
        }
    }

    async fn persist_append(
        &self,
        core: &RaftCore<M>,
        entries: &[LogEntry<M::Command>],
        new_len: usize,
    ) {
        if self.storage.append_log(entries, new_len).await.is_ok() {
            return;
        }
        warn!(node = self.id, "log append failed, rewriting the full log");
        self.persist_log(core).await;
    }

    async fn persist_log(&self, core: &RaftCore<M>) {
        if let Err(err) = self.storage.update_log(core.log.entries()).await {
            error!(node = self.id, %err, "log persist failed");
            panic!("raft storage failure: {err}");
        }
    }

    async fn persist_snapshot(&self, snapshot: &[u8]) {
        if let Err(err) = self.storage.update_snapshot(snapshot).await {
            error!(node = self.id, %err, "snapshot persist failed");
            panic!("raft storage failure: {err}");
        }
    }

    // ---- background activities ----

    /// Watches leader liveness; promotes to candidate when the randomized
    /// timeout elapses without a valid leader or a granted vote.
    async fn run_election_timer(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.tick_interval()).await;
            if self.is_stopped() {
                return;
            }

            let mut core = self.core.lock().await;
            let timeout = match core.role {
                Role::Follower => core.follower_timeout,
                Role::Candidate => core.candidate_timeout,
                Role::Leader => continue,
            };
            if core.last_heard.elapsed() < timeout {
                continue;
            }

            core.role = Role::Candidate;
            core.current_term += 1;
            core.voted_for = Some(self.id);
            core.tally = VoteTally::new(self.id);
            core.rearm_timers(&self.config);
            core.last_heard = Instant::now();

            let term = core.current_term;
            info!(node = self.id, term, "election timeout, requesting votes");
            self.persist_metadata(term, Some(self.id)).await;

            // a majority-of-one needs no replies
            if core.tally.count() > self.cluster.len() / 2 {
                let batch = self.become_leader(&mut core);
                drop(core);
                for (peer, heartbeat) in batch {
                    Self::spawn_append_entries(&self, peer, heartbeat);
                }
                continue;
            }

            let args = RequestVoteArgs {
                term,
                candidate_id: self.id,
                last_log_index: core.log.last_index(),
                last_log_term: core.log.last_term(),
            };
            drop(core);

            for &peer in self.cluster.iter().filter(|&&peer| peer != self.id) {
                Self::spawn_request_vote(&self, peer, args.clone());
            }
        }
    }

    /// Leader-only: refreshes followers so their election timers stay
    /// quiet.
    async fn run_heartbeater(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval()).await;
            if self.is_stopped() {
                return;
            }

            let core = self.core.lock().await;
            if core.role != Role::Leader {
                continue;
            }
            let batch = self.heartbeat_batch(&core);
            drop(core);

            for (peer, args) in batch {
                Self::spawn_append_entries(&self, peer, args);
            }
        }
    }

    /// Leader-only: pushes missing entries to each follower, or a snapshot
    /// when the follower is behind the log base.
    async fn run_replicator(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.tick_interval()).await;
            if self.is_stopped() {
                return;
            }

            let core = self.core.lock().await;
            if core.role != Role::Leader {
                continue;
            }
            let progress = match core.progress.as_ref() {
                Some(progress) => progress,
                None => continue,
            };

            let last = core.log.last_index();
            let base = core.log.base();
            let mut appends = Vec::new();
            let mut snapshots = Vec::new();

            for &peer in self.cluster.iter().filter(|&&peer| peer != self.id) {
                let next = progress.next_index(peer);
                if next > last {
                    continue;
                }
                if next > base {
                    let prev = next - 1;
                    let prev_term = match core.log.term_at(prev) {
                        Some(term) => term,
                        None => continue,
                    };
                    appends.push((
                        peer,
                        AppendEntriesArgs {
                            term: core.current_term,
                            leader_id: self.id,
                            prev_log_index: prev,
                            prev_log_term: prev_term,
                            entries: core.log.range(next, last + 1),
                            leader_commit: core.commit_index,
                        },
                    ));
                } else {
                    snapshots.push((
                        peer,
                        InstallSnapshotArgs {
                            term: core.current_term,
                            leader_id: self.id,
                            last_included_index: base,
                            last_included_term: core.log.term_at(base).unwrap_or(0),
                            snapshot: core.snapshot.clone(),
                        },
                    ));
                }
            }
            drop(core);

            for (peer, args) in appends {
                Self::spawn_append_entries(&self, peer, args);
            }
            for (peer, args) in snapshots {
                Self::spawn_install_snapshot(&self, peer, args);
            }
        }
    }

    /// All roles: delivers committed entries to the state machine, in
    /// index order, single-threaded.
    async fn run_applier(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.tick_interval()).await;
            if self.is_stopped() {
                return;
            }

            let mut core = self.core.lock().await;
            if core.commit_index <= core.last_applied {
                continue;
            }

            let entries = core.log.range(core.last_applied + 1, core.commit_index + 1);
            for entry in &entries {
                core.machine.apply(&entry.cmd);
            }
            core.last_applied = core.commit_index;
            trace!(node = self.id, applied_through = core.last_applied, "applied");
        }
    }

    // ---- leadership ----

    fn become_leader(
        &self,
        core: &mut RaftCore<M>,
    ) -> Vec<(NodeId, AppendEntriesArgs<M::Command>)> {
        core.role = Role::Leader;
        core.progress = Some(LeaderProgress::new(
            &self.cluster,
            self.id,
            core.log.last_index(),
            core.commit_index,
        ));
        info!(node = self.id, term = core.current_term, "won election");
        self.heartbeat_batch(core)
    }

    /// One empty AppendEntries per reachable follower. A follower behind
    /// the log base is skipped; the replicator sends it a snapshot instead,
    /// which refreshes its election timer just as well.
    fn heartbeat_batch(
        &self,
        core: &RaftCore<M>,
    ) -> Vec<(NodeId, AppendEntriesArgs<M::Command>)> {
        let progress = match core.progress.as_ref() {
            Some(progress) => progress,
            None => return Vec::new(),
        };

        let mut batch = Vec::new();
        for &peer in self.cluster.iter().filter(|&&peer| peer != self.id) {
            let next = progress.next_index(peer);
            if next <= core.log.base() {
                continue;
            }
            let prev = next - 1;
            let prev_term = match core.log.term_at(prev) {
                Some(term) => term,
                None => continue,
            };
            batch.push((
                peer,
                AppendEntriesArgs::heartbeat(
                    core.current_term,
                    self.id,
                    prev,
                    prev_term,
                    core.commit_index,
                ),
            ));
        }
        batch
    }

    fn advance_commit(&self, core: &mut RaftCore<M>) {
        let step = {
            let RaftCore { ref mut progress, ref log, current_term, commit_index, .. } = *core;
            let progress = match progress.as_mut() {
                Some(progress) => progress,
                None => return,
            };
            let term_ok = |index: LogIndex| log.term_at(index) == Some(current_term);
            match progress.commit_step(commit_index, self.cluster.len(), term_ok) {
                Some(step) => {
                    progress.drain_committed(step);
                    step
                }
                None => return,
            }
        };
        core.commit_index += step;
        debug!(node = self.id, commit_index = core.commit_index, "commit index advanced");
    }

    // ---- outgoing RPCs ----
    //
    // Send failures are swallowed: the next replicator or heartbeat tick
    // retries naturally, and a dead peer is indistinguishable from a slow
    // one anyway.

    fn spawn_request_vote(node: &Arc<Self>, target: NodeId, args: RequestVoteArgs) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            match node.transport.request_vote(target, args.clone()).await {
                Ok(reply) => Self::handle_request_vote_reply(&node, target, args, reply).await,
                Err(err) => trace!(node = node.id, target, %err, "vote request failed"),
            }
        });
    }

    fn spawn_append_entries(node: &Arc<Self>, target: NodeId, args: AppendEntriesArgs<M::Command>) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            match node.transport.append_entries(target, args.clone()).await {
                Ok(reply) => node.handle_append_entries_reply(target, args, reply).await,
                Err(err) => trace!(node = node.id, target, %err, "append entries failed"),
            }
        });
    }

    fn spawn_install_snapshot(node: &Arc<Self>, target: NodeId, args: InstallSnapshotArgs) {
        let node = Arc::clone(node);
        tokio::spawn(async move {
            match node.transport.install_snapshot(target, args.clone()).await {
                Ok(reply) => node.handle_install_snapshot_reply(target, args, reply).await,
                Err(err) => trace!(node = node.id, target, %err, "install snapshot failed"),
            }
        });
    }

    // ---- reply handling ----
    //
    // A reply is acted on only if the replica is still in the sending role
    // and the argument's term is still the current one; a higher reply
    // term forces a step-down first.

    async fn handle_request_vote_reply(
        node: &Arc<Self>,
        target: NodeId,
        args: RequestVoteArgs,
        reply: RequestVoteReply,
    ) {
        if node.is_stopped() {
            return;
        }
        let mut core = node.core.lock().await;

        if reply.term > core.current_term {
            if core.step_down(reply.term, &node.config) {
                node.persist_metadata(core.current_term, core.voted_for).await;
            }
            return;
        }
        if core.role != Role::Candidate || args.term != core.current_term {
            return;
        }

        if reply.granted && core.tally.record(target) {
            debug!(node = node.id, term = core.current_term, from = target, "vote received");
            if core.tally.count() > node.cluster.len() / 2 {
                let batch = node.become_leader(&mut core);
                drop(core);
                for (peer, heartbeat) in batch {
                    Self::spawn_append_entries(node, peer, heartbeat);
                }
            }
        }
    }

    async fn handle_append_entries_reply(
        &self,
        target: NodeId,
        args: AppendEntriesArgs<M::Command>,
        reply: AppendEntriesReply,
    ) {
        if self.is_stopped() {
            return;
        }
        let mut core = self.core.lock().await;

        if reply.term > core.current_term {
            if core.step_down(reply.term, &self.config) {
                self.persist_metadata(core.current_term, core.voted_for).await;
            }
            return;
        }
        if core.role != Role::Leader || args.term != core.current_term {
            return;
        }

        if reply.success {
            let new_match = args.prev_log_index + args.entries.len() as u64;
            let commit_index = core.commit_index;
            if let Some(progress) = core.progress.as_mut() {
                progress.observe_match(target, new_match, commit_index);
            }
            self.advance_commit(&mut core);
        } else if let Some(progress) = core.progress.as_mut() {
            progress.retreat(target, args.prev_log_index);
            trace!(node = self.id, target, next = progress.next_index(target), "follower rejected, retreating");
        }
    }

    async fn handle_install_snapshot_reply(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
        reply: InstallSnapshotReply,
    ) {
        if self.is_stopped() {
            return;
        }
        let mut core = self.core.lock().await;

        if reply.term > core.current_term {
            if core.step_down(reply.term, &self.config) {
                self.persist_metadata(core.current_term, core.voted_for).await;
            }
            return;
        }
        if core.role != Role::Leader || args.term != core.current_term {
            return;
        }

        let commit_index = core.commit_index;
        if let Some(progress) = core.progress.as_mut() {
            progress.observe_match(target, args.last_included_index, commit_index);
        }
    }
}

#[async_trait]
impl<M: StateMachine + Sync> RaftService<M::Command> for RaftNode<M> {
    /// Grant a vote iff the candidate's term is current, no conflicting
    /// vote was granted this term, and the candidate's log is at least as
    /// up-to-date as ours.
    async fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut core = self.core.lock().await;

        // a caller outside the cluster gets an answer but no side effects
        if !self.cluster.contains(&args.candidate_id) {
            return RequestVoteReply { term: core.current_term, granted: false };
        }
        if args.term < core.current_term {
            return RequestVoteReply { term: core.current_term, granted: false };
        }
        if args.term > core.current_term && core.step_down(args.term, &self.config) {
            self.persist_metadata(core.current_term, core.voted_for).await;
        }

        let up_to_date = args.last_log_term > core.log.last_term()
            || (args.last_log_term == core.log.last_term()
                && args.last_log_index >= core.log.last_index());
        let free_to_vote =
            core.voted_for.is_none() || core.voted_for == Some(args.candidate_id);
        let granted = free_to_vote && up_to_date;

        if granted {
            core.voted_for = Some(args.candidate_id);
            // only an actual grant refreshes the election timer
            core.last_heard = Instant::now();
            self.persist_metadata(core.current_term, core.voted_for).await;
            debug!(node = self.id, term = core.current_term, candidate = args.candidate_id, "vote granted");
        }

        RequestVoteReply { term: core.current_term, granted }
    }

    /// Accept entries iff the leader's consistency point matches our log;
    /// repair any conflicting suffix, append what is missing, and follow
    /// the leader's commit index.
    async fn append_entries(&self, args: AppendEntriesArgs<M::Command>) -> AppendEntriesReply {
        let mut core = self.core.lock().await;

        if !self.cluster.contains(&args.leader_id) {
            return AppendEntriesReply { term: core.current_term, success: false };
        }
        if args.term < core.current_term {
            return AppendEntriesReply { term: core.current_term, success: false };
        }
        if (args.term > core.current_term || core.role == Role::Candidate)
            && core.step_down(args.term, &self.config)
        {
            self.persist_metadata(core.current_term, core.voted_for).await;
        }
        core.last_heard = Instant::now();

        if !core.log.matches(args.prev_log_index, args.prev_log_term) {
            trace!(
                node = self.id,
                term = core.current_term,
                prev = args.prev_log_index,
                "log mismatch, rejecting entries"
            );
            return AppendEntriesReply { term: core.current_term, success: false };
        }

        if !args.entries.is_empty() {
            let outcome = core.log.merge(args.entries);
            let total = core.log.entries().len();
            if outcome.truncated {
                self.persist_log(&core).await;
            } else if outcome.appended > 0 {
                self.persist_append(&core, &core.log.entries()[total - outcome.appended..], total)
                    .await;
            }
        }

        if args.leader_commit > core.commit_index {
            core.commit_index = args.leader_commit.min(core.log.last_index());
        }

        AppendEntriesReply { term: core.current_term, success: true }
    }

    /// Replace the log prefix (or the whole log) with the leader's
    /// snapshot and hand the blob to the state machine.
    async fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut guard = self.core.lock().await;
        let core = &mut *guard;

        if !self.cluster.contains(&args.leader_id) {
            return InstallSnapshotReply { term: core.current_term };
        }
        if args.term < core.current_term {
            return InstallSnapshotReply { term: core.current_term };
        }
        if (args.term > core.current_term || core.role == Role::Candidate)
            && core.step_down(args.term, &self.config)
        {
            self.persist_metadata(core.current_term, core.voted_for).await;
        }
        core.last_heard = Instant::now();

        // A boundary at or below what we already applied is a duplicate or
        // a stale retransmission; acknowledging without acting keeps
        // last_applied monotone.
        if args.last_included_index <= core.last_applied {
            return InstallSnapshotReply { term: core.current_term };
        }

        if args.last_included_index <= core.log.last_index()
            && core.log.term_at(args.last_included_index) == Some(args.last_included_term)
        {
            core.log.compact_to(args.last_included_index);
        } else {
            core.log.reset_to(args.last_included_index, args.last_included_term);
        }

        core.snapshot = args.snapshot;
        core.machine.apply_snapshot(&core.snapshot);
        core.last_applied = args.last_included_index;
        core.commit_index = core.commit_index.max(args.last_included_index);

        self.persist_log(core).await;
        self.persist_snapshot(&core.snapshot).await;

        info!(
            node = self.id,
            term = core.current_term,
            boundary = args.last_included_index,
            "snapshot installed"
        );
        InstallSnapshotReply { term: core.current_term }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::storage::MemoryStorage;
    use crate::raft::testutil::{RegisterMachine, TestCommand};
    use crate::transport::LocalRouter;

    const CLUSTER: [NodeId; 3] = [0, 1, 2];

    /// A node with nothing started: handlers only, no background noise.
    async fn idle_node(id: NodeId) -> Arc<RaftNode<RegisterMachine>> {
        let router = LocalRouter::<TestCommand>::new();
        RaftNode::new(
            id,
            CLUSTER.to_vec(),
            RaftConfig::default(),
            Arc::new(router.transport(id)),
            Arc::new(MemoryStorage::new()),
            RegisterMachine::default(),
        )
        .await
        .unwrap()
    }

    fn vote_args(term: Term, candidate_id: NodeId) -> RequestVoteArgs {
        RequestVoteArgs { term, candidate_id, last_log_index: 0, last_log_term: 0 }
    }

    fn entries_args(
        term: Term,
        prev: LogIndex,
        prev_term: Term,
        values: &[(LogIndex, Term, u64)],
        leader_commit: LogIndex,
    ) -> AppendEntriesArgs<TestCommand> {
        AppendEntriesArgs {
            term,
            leader_id: 1,
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries: values
                .iter()
                .map(|&(index, term, value)| LogEntry::new(index, term, TestCommand(value)))
                .collect(),
            leader_commit,
        }
    }

    #[tokio::test]
    async fn fresh_replica_starts_as_follower_and_persists() {
        let storage: MemoryStorage<TestCommand> = MemoryStorage::new();
        let router = LocalRouter::<TestCommand>::new();
        let node = RaftNode::new(
            0,
            CLUSTER.to_vec(),
            RaftConfig::default(),
            Arc::new(router.transport(0)),
            Arc::new(storage.clone()),
            RegisterMachine::default(),
        )
        .await
        .unwrap();

        let status = node.status().await;
        assert_eq!(status.role, Role::Follower);
        assert_eq!(status.term, 0);
        assert_eq!(status.last_log_index, 0);

        // the fresh state was written back
        let durable = storage.restore().await.unwrap().unwrap();
        assert_eq!(durable.current_term, 0);
        assert_eq!(durable.log.len(), 1);
    }

    #[tokio::test]
    async fn grants_at_most_one_vote_per_term() {
        let node = idle_node(0).await;

        let first = node.request_vote(vote_args(1, 1)).await;
        assert!(first.granted);
        assert_eq!(first.term, 1);

        // same term, different candidate
        let second = node.request_vote(vote_args(1, 2)).await;
        assert!(!second.granted);

        // same candidate again: still granted (idempotent)
        let again = node.request_vote(vote_args(1, 1)).await;
        assert!(again.granted);
    }

    #[tokio::test]
    async fn rejects_candidates_with_stale_logs() {
        let node = idle_node(0).await;
        let accepted = node
            .append_entries(entries_args(1, 0, 0, &[(1, 1, 10), (2, 1, 20)], 0))
            .await;
        assert!(accepted.success);

        // candidate whose last log is older than ours
        let stale = node.request_vote(vote_args(2, 2)).await;
        assert!(!stale.granted);

        // candidate with a matching log
        let args = RequestVoteArgs { term: 2, candidate_id: 2, last_log_index: 2, last_log_term: 1 };
        assert!(node.request_vote(args).await.granted);
    }

    #[tokio::test]
    async fn stale_terms_are_refused() {
        let node = idle_node(0).await;
        node.request_vote(vote_args(5, 1)).await;

        assert!(!node.request_vote(vote_args(3, 2)).await.granted);
        let reply = node.append_entries(entries_args(3, 0, 0, &[], 0)).await;
        assert!(!reply.success);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn callers_outside_the_cluster_are_ignored() {
        let node = idle_node(0).await;
        let reply = node.request_vote(vote_args(9, 42)).await;
        assert!(!reply.granted);
        assert_eq!(node.status().await.term, 0);
    }

    #[tokio::test]
    async fn append_rejects_a_missing_prev_entry() {
        let node = idle_node(0).await;
        let reply = node.append_entries(entries_args(1, 5, 1, &[(6, 1, 60)], 0)).await;
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn append_repairs_a_conflicting_suffix() {
        let node = idle_node(0).await;
        node.append_entries(entries_args(1, 0, 0, &[(1, 1, 10), (2, 1, 20), (3, 1, 30)], 0)).await;

        // a new leader in term 2 rewrites indices 2..3
        let reply =
            node.append_entries(entries_args(2, 1, 1, &[(2, 2, 21), (3, 2, 31)], 2)).await;
        assert!(reply.success);

        let status = node.status().await;
        assert_eq!(status.last_log_index, 3);
        assert_eq!(status.commit_index, 2);
    }

    #[tokio::test]
    async fn commit_index_follows_the_leader_but_not_past_the_log() {
        let node = idle_node(0).await;
        let reply = node.append_entries(entries_args(1, 0, 0, &[(1, 1, 10)], 7)).await;
        assert!(reply.success);
        assert_eq!(node.status().await.commit_index, 1);
    }

    #[tokio::test]
    async fn install_snapshot_resets_a_diverged_log() {
        let node = idle_node(0).await;
        node.append_entries(entries_args(1, 0, 0, &[(1, 1, 10), (2, 1, 20)], 0)).await;

        let mut machine = RegisterMachine::default();
        machine.applied = vec![10, 20, 30, 40, 50];
        let args = InstallSnapshotArgs {
            term: 2,
            leader_id: 1,
            last_included_index: 5,
            last_included_term: 1,
            snapshot: machine.snapshot(),
        };
        let reply = node.install_snapshot(args).await;
        assert_eq!(reply.term, 2);

        let status = node.status().await;
        assert_eq!(status.last_log_index, 5);
        assert_eq!(status.last_applied, 5);
        assert_eq!(status.commit_index, 5);
        let applied = node.read_machine(|m| m.applied.clone()).await;
        assert_eq!(applied, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn install_snapshot_keeps_a_matching_tail() {
        let node = idle_node(0).await;
        node.append_entries(entries_args(1, 0, 0, &[(1, 1, 10), (2, 1, 20), (3, 1, 30)], 1)).await;

        let args = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 2,
            last_included_term: 1,
            snapshot: RegisterMachine { applied: vec![10, 20] }.snapshot(),
        };
        node.install_snapshot(args).await;

        let status = node.status().await;
        assert_eq!(status.last_applied, 2);
        assert_eq!(status.last_log_index, 3);
    }

    #[tokio::test]
    async fn stale_snapshots_are_acknowledged_but_ignored() {
        let node = idle_node(0).await;
        let fresh = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 4,
            last_included_term: 1,
            snapshot: RegisterMachine { applied: vec![1, 2, 3, 4] }.snapshot(),
        };
        node.install_snapshot(fresh).await;
        assert_eq!(node.status().await.last_applied, 4);

        // a duplicate of an older snapshot arrives late
        let stale = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 2,
            last_included_term: 1,
            snapshot: RegisterMachine { applied: vec![1, 2] }.snapshot(),
        };
        node.install_snapshot(stale).await;
        assert_eq!(node.status().await.last_applied, 4);
    }

    #[tokio::test]
    async fn submit_refuses_when_not_leader() {
        let node = idle_node(0).await;
        assert!(node.submit(TestCommand(1)).await.is_none());
    }
}
