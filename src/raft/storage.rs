//! Durable replica state
//!
//! Three artifacts per replica: the metadata blob `(current_term,
//! voted_for)`, the log, and the snapshot. Each update is atomic from the
//! replica's view: after a crash, recovery observes at least the pre-call
//! state, and the post-call state if the call returned. The log has an
//! append-only fast path whose failure signals the engine to fall back to a
//! full rewrite.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use quorumfs_core::{Command, NodeId, Term};

use super::rpc::LogEntry;
use super::{RaftError, Result};

/// Everything a replica recovers after a restart.
#[derive(Debug, Clone)]
pub struct DurableState<C> {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry<C>>,
    pub snapshot: Vec<u8>,
}

/// Persistent storage interface for a replica.
#[async_trait]
pub trait RaftStorage<C: Command>: Send + Sync {
    /// Restore the last persisted state. `None` means a fresh store.
    async fn restore(&self) -> Result<Option<DurableState<C>>>;

    /// Persist `(current_term, voted_for)`.
    async fn update_metadata(&self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    /// Append entries at the log tail. `new_len` is the total entry count
    /// after the append. On error the caller falls back to `update_log`.
    async fn append_log(&self, entries: &[LogEntry<C>], new_len: usize) -> Result<()>;

    /// Rewrite the whole log.
    async fn update_log(&self, entries: &[LogEntry<C>]) -> Result<()>;

    /// Replace the snapshot blob.
    async fn update_snapshot(&self, snapshot: &[u8]) -> Result<()>;
}

const META_FILE: &str = "meta";
const LOG_FILE: &str = "log";
const SNAP_FILE: &str = "snap";

/// File-backed storage.
///
/// The log file is a `u64` entry count followed by wire-encoded entries;
/// `append_log` extends the tail before rewriting the header, so a crash
/// mid-append leaves the previous prefix visible. Metadata, snapshot, and
/// full log rewrites go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open storage rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    async fn replace(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let tmp = self.path(&format!("{name}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.path(name)).await?;
        Ok(())
    }

    async fn read_optional(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn encode_log<C: Command>(entries: &[LogEntry<C>]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(entries.len() as u64).to_be_bytes());
    for entry in entries {
        entry.encode(&mut buf);
    }
    buf
}

fn decode_log<C: Command>(bytes: &[u8]) -> Result<Vec<LogEntry<C>>> {
    let mut buf = bytes;
    if buf.remaining() < 8 {
        return Err(RaftError::Storage("log file header truncated".to_string()));
    }
    let count = buf.get_u64() as usize;
    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        entries.push(LogEntry::decode(&mut buf)?);
    }
    Ok(entries)
}

#[async_trait]
impl<C: Command> RaftStorage<C> for FileStorage {
    async fn restore(&self) -> Result<Option<DurableState<C>>> {
        let meta = match self.read_optional(META_FILE).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (current_term, voted_for): (Term, Option<NodeId>) = bincode::deserialize(&meta)
            .map_err(|err| RaftError::Storage(format!("metadata decode failed: {err}")))?;

        let log = match self.read_optional(LOG_FILE).await? {
            Some(bytes) => decode_log(&bytes)?,
            None => vec![LogEntry::sentinel(0, 0)],
        };
        let snapshot = self.read_optional(SNAP_FILE).await?.unwrap_or_default();

        Ok(Some(DurableState { current_term, voted_for, log, snapshot }))
    }

    async fn update_metadata(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let bytes = bincode::serialize(&(term, voted_for))
            .map_err(|err| RaftError::Storage(format!("metadata encode failed: {err}")))?;
        self.replace(META_FILE, &bytes).await
    }

    async fn append_log(&self, entries: &[LogEntry<C>], new_len: usize) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.path(LOG_FILE))
            .await?;

        let mut tail = BytesMut::new();
        for entry in entries {
            entry.encode(&mut tail);
        }
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(&tail).await?;
        file.sync_data().await?;

        // The header flips last: a crash before this point leaves the old
        // entry count pointing at the old prefix.
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&(new_len as u64).to_be_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn update_log(&self, entries: &[LogEntry<C>]) -> Result<()> {
        self.replace(LOG_FILE, &encode_log(entries)).await
    }

    async fn update_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        self.replace(SNAP_FILE, snapshot).await
    }
}

/// In-memory storage for tests. Clones share the underlying store, so a
/// "restarted" replica can be handed a clone to recover from.
#[derive(Debug, Clone)]
pub struct MemoryStorage<C> {
    inner: std::sync::Arc<tokio::sync::RwLock<MemoryInner<C>>>,
}

#[derive(Debug)]
struct MemoryInner<C> {
    state: Option<DurableState<C>>,
    fail_appends: bool,
}

impl<C: Command> MemoryStorage<C> {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Arc::new(tokio::sync::RwLock::new(MemoryInner {
                state: None,
                fail_appends: false,
            })),
        }
    }

    /// Make `append_log` fail, forcing callers onto the full-rewrite path.
    pub async fn set_fail_appends(&self, fail: bool) {
        self.inner.write().await.fail_appends = fail;
    }
}

impl<C: Command> Default for MemoryStorage<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Command> RaftStorage<C> for MemoryStorage<C> {
    async fn restore(&self) -> Result<Option<DurableState<C>>> {
        Ok(self.inner.read().await.state.clone())
    }

    async fn update_metadata(&self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner.state.get_or_insert_with(|| DurableState {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel(0, 0)],
            snapshot: Vec::new(),
        });
        state.current_term = term;
        state.voted_for = voted_for;
        Ok(())
    }

    async fn append_log(&self, entries: &[LogEntry<C>], new_len: usize) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.fail_appends {
            return Err(RaftError::Storage("append rejected".to_string()));
        }
        let state = match inner.state.as_mut() {
            Some(state) => state,
            None => return Err(RaftError::Storage("no log to append to".to_string())),
        };
        state.log.extend_from_slice(entries);
        debug_assert_eq!(state.log.len(), new_len);
        Ok(())
    }

    async fn update_log(&self, entries: &[LogEntry<C>]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner.state.get_or_insert_with(|| DurableState {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot: Vec::new(),
        });
        state.log = entries.to_vec();
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let state = inner.state.get_or_insert_with(|| DurableState {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel(0, 0)],
            snapshot: Vec::new(),
        });
        state.snapshot = snapshot.to_vec();
        Ok(())
    }
}
