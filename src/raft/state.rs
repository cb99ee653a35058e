//! Volatile per-role replica state

use std::collections::{HashMap, HashSet};

use quorumfs_core::{LogIndex, NodeId};

/// Votes gathered by a candidate in its current term.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    granted: HashSet<NodeId>,
}

impl VoteTally {
    /// A candidate starts with its own vote.
    pub fn new(self_id: NodeId) -> Self {
        let mut granted = HashSet::new();
        granted.insert(self_id);
        Self { granted }
    }

    /// Record a grant. Duplicate grants from the same peer do not count
    /// twice; returns whether the grant was new.
    pub fn record(&mut self, from: NodeId) -> bool {
        self.granted.insert(from)
    }

    pub fn count(&self) -> usize {
        self.granted.len()
    }
}

/// Leader bookkeeping: per-peer replication progress plus the majority
/// tally used to advance the commit index.
///
/// `match_count` slot `k` counts replicas, the leader included, known to
/// hold the entry at `commit_index + k + 1`. Offsets are relative to the
/// commit index, so advancing the commit by `n` steps must drain exactly
/// the first `n` slots.
#[derive(Debug, Clone)]
pub struct LeaderProgress {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    match_count: Vec<u64>,
}

impl LeaderProgress {
    /// Fresh progress on winning an election: every peer is optimistically
    /// expected at the leader's tail, nothing is known replicated, and the
    /// leader itself holds every entry above the commit index.
    pub fn new(
        cluster: &[NodeId],
        self_id: NodeId,
        last_log_index: LogIndex,
        commit_index: LogIndex,
    ) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for &node in cluster {
            next_index.insert(node, last_log_index + 1);
            match_index.insert(node, 0);
        }
        match_index.insert(self_id, last_log_index);

        Self {
            next_index,
            match_index,
            match_count: vec![1; (last_log_index - commit_index) as usize],
        }
    }

    pub fn next_index(&self, peer: NodeId) -> LogIndex {
        self.next_index.get(&peer).copied().unwrap_or(1)
    }

    pub fn match_index(&self, peer: NodeId) -> LogIndex {
        self.match_index.get(&peer).copied().unwrap_or(0)
    }

    /// The leader appended an entry locally: it trivially matches its own
    /// tail, and the new entry starts with one holder.
    pub fn record_local_append(&mut self, self_id: NodeId, index: LogIndex) {
        self.next_index.insert(self_id, index + 1);
        self.match_index.insert(self_id, index);
        self.match_count.push(1);
    }

    /// A peer acknowledged entries through `new_match`. Bumps the coverage
    /// count of every slot the peer newly reached. Stale acknowledgements
    /// (at or below the recorded match) are ignored, which keeps a
    /// duplicated reply from counting twice.
    pub fn observe_match(&mut self, peer: NodeId, new_match: LogIndex, commit_index: LogIndex) {
        let prev = self.match_index(peer);
        if new_match <= prev {
            return;
        }
        self.match_index.insert(peer, new_match);
        self.next_index.insert(peer, new_match + 1);

        let first = prev.max(commit_index) + 1;
        for index in first..=new_match {
            let slot = (index - commit_index - 1) as usize;
            if let Some(count) = self.match_count.get_mut(slot) {
                *count += 1;
            }
        }
    }

    /// A peer rejected an AppendEntries at `prev_log_index`. Retreat its
    /// next index toward the rejection point; never below 1 and never
    /// forward.
    pub fn retreat(&mut self, peer: NodeId, prev_log_index: LogIndex) {
        let next = self.next_index.entry(peer).or_insert(1);
        *next = (*next).min(prev_log_index).max(1);
    }

    /// Largest step `n` such that a majority of the cluster holds
    /// `commit_index + n` and the entry passes the caller's term check
    /// (the rule forbidding commit of prior-term entries by count alone).
    pub fn commit_step(
        &self,
        commit_index: LogIndex,
        cluster_size: usize,
        term_ok: impl Fn(LogIndex) -> bool,
    ) -> Option<u64> {
        for step in (1..=self.match_count.len() as u64).rev() {
            let holders = self.match_count[(step - 1) as usize] as usize;
            if holders > cluster_size / 2 && term_ok(commit_index + step) {
                return Some(step);
            }
        }
        None
    }

    /// The commit index advanced by `steps`: drop the tally slots it
    /// passed so remaining slots stay aligned to the new commit index.
    pub fn drain_committed(&mut self, steps: u64) {
        self.match_count.drain(..(steps as usize).min(self.match_count.len()));
    }
}
