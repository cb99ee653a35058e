//! Raft RPC message definitions and wire format
//!
//! Field order on the wire is part of the protocol. Integers are fixed-width
//! big-endian, booleans one byte, commands a `u32` length followed by the
//! bytes the command serialized itself into. Replies travel with a status
//! code from [`RpcStatus`].

use bytes::{Buf, BufMut, BytesMut};
use quorumfs_core::{Command, LogIndex, NodeId, Term};

/// Opcode of the RequestVote RPC.
pub const OP_REQUEST_VOTE: u32 = 0x1212;
/// Opcode of the AppendEntries RPC.
pub const OP_APPEND_ENTRIES: u32 = 0x3434;
/// Opcode of the InstallSnapshot RPC.
pub const OP_INSTALL_SNAPSHOT: u32 = 0x5656;

/// Status codes carried on the reply frame of every RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RpcStatus {
    Ok = 0,
    Retry = 1,
    RpcError = 2,
    NoEntity = 3,
    IoError = 4,
}

impl RpcStatus {
    pub fn from_u32(raw: u32) -> Result<Self, CodecError> {
        match raw {
            0 => Ok(RpcStatus::Ok),
            1 => Ok(RpcStatus::Retry),
            2 => Ok(RpcStatus::RpcError),
            3 => Ok(RpcStatus::NoEntity),
            4 => Ok(RpcStatus::IoError),
            other => Err(CodecError::UnknownStatus(other)),
        }
    }
}

/// Wire format violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,

    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u32),

    #[error("unknown status code {0}")]
    UnknownStatus(u32),

    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
}

/// One entry of the replicated log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry<C> {
    /// Position in the log, dense from the log base
    pub index: LogIndex,

    /// Leader term under which the entry was created
    pub term: Term,

    /// Replicated command; empty on sentinel entries
    pub cmd: C,
}

impl<C: Command> LogEntry<C> {
    /// Create a command-carrying entry.
    pub fn new(index: LogIndex, term: Term, cmd: C) -> Self {
        Self { index, term, cmd }
    }

    /// Create a sentinel entry: the log origin or a snapshot boundary. Its
    /// command is empty and never applied.
    pub fn sentinel(index: LogIndex, term: Term) -> Self {
        Self { index, term, cmd: C::default() }
    }
}

/// RequestVote RPC - invoked by candidates to gather votes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteReply {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// True means the candidate received the vote
    pub granted: bool,
}

/// AppendEntries RPC - used for log replication and heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntriesArgs<C> {
    /// Leader's term
    pub term: Term,

    /// Leader id, so followers learn who leads the term
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry<C>>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

impl<C: Command> AppendEntriesArgs<C> {
    /// Create a heartbeat (empty entries).
    pub fn heartbeat(
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        leader_commit: LogIndex,
    ) -> Self {
        Self { term, leader_id, prev_log_index, prev_log_term, entries: Vec::new(), leader_commit }
    }

    /// Whether this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesReply {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower matched `prev_log_index` / `prev_log_term`
    pub success: bool,
}

/// InstallSnapshot RPC - catches up a follower that fell behind the leader's
/// log base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: Term,

    /// Leader id
    pub leader_id: NodeId,

    /// The snapshot replaces all entries up to and including this index
    pub last_included_index: LogIndex,

    /// Term of the entry at `last_included_index`
    pub last_included_term: Term,

    /// Opaque state machine blob
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotReply {
    /// Current term, for the leader to update itself
    pub term: Term,
}

// ---- wire encoding ----

fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

fn get_bool(buf: &mut impl Buf) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidBool(other)),
    }
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64())
}

fn put_blob(buf: &mut BytesMut, blob: &[u8]) {
    buf.put_u32(blob.len() as u32);
    buf.put_slice(blob);
}

fn get_blob(buf: &mut impl Buf) -> Result<Vec<u8>, CodecError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let mut blob = vec![0u8; len];
    buf.copy_to_slice(&mut blob);
    Ok(blob)
}

impl<C: Command> LogEntry<C> {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index);
        buf.put_u64(self.term);
        let mut cmd = vec![0u8; self.cmd.size()];
        self.cmd.serialize(&mut cmd);
        put_blob(buf, &cmd);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let index = get_u64(buf)?;
        let term = get_u64(buf)?;
        let cmd = get_blob(buf)?;
        Ok(Self { index, term, cmd: C::deserialize(&cmd) })
    }
}

impl RequestVoteArgs {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        buf.put_u64(self.candidate_id);
        buf.put_u64(self.last_log_index);
        buf.put_u64(self.last_log_term);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            term: get_u64(buf)?,
            candidate_id: get_u64(buf)?,
            last_log_index: get_u64(buf)?,
            last_log_term: get_u64(buf)?,
        })
    }
}

impl RequestVoteReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        put_bool(buf, self.granted);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self { term: get_u64(buf)?, granted: get_bool(buf)? })
    }
}

impl<C: Command> AppendEntriesArgs<C> {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        buf.put_u64(self.leader_id);
        buf.put_u64(self.prev_log_index);
        buf.put_u64(self.prev_log_term);
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode(buf);
        }
        buf.put_u64(self.leader_commit);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let term = get_u64(buf)?;
        let leader_id = get_u64(buf)?;
        let prev_log_index = get_u64(buf)?;
        let prev_log_term = get_u64(buf)?;
        let count = get_u32(buf)? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            entries.push(LogEntry::decode(buf)?);
        }
        let leader_commit = get_u64(buf)?;
        Ok(Self { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit })
    }
}

impl AppendEntriesReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        put_bool(buf, self.success);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self { term: get_u64(buf)?, success: get_bool(buf)? })
    }
}

impl InstallSnapshotArgs {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
        buf.put_u64(self.leader_id);
        buf.put_u64(self.last_included_index);
        buf.put_u64(self.last_included_term);
        put_blob(buf, &self.snapshot);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self {
            term: get_u64(buf)?,
            leader_id: get_u64(buf)?,
            last_included_index: get_u64(buf)?,
            last_included_term: get_u64(buf)?,
            snapshot: get_blob(buf)?,
        })
    }
}

impl InstallSnapshotReply {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.term);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        Ok(Self { term: get_u64(buf)? })
    }
}
