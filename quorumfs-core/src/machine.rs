//! Plug-in contracts between the consensus engine and the application.
//!
//! The engine replicates opaque commands and delivers them, committed and
//! totally ordered, to an application state machine. Commands own their wire
//! representation: a stable byte size, a serialize into a caller-provided
//! region, and a deserialize from such a region. The engine never interprets
//! command bytes.

/// A replicated command.
///
/// `Default` supplies the empty command carried by log sentinels; it is
/// never applied.
pub trait Command: Clone + Default + Send + Sync + 'static {
    /// Number of bytes `serialize` will write.
    fn size(&self) -> usize;

    /// Write the command into `buf`, which is exactly `self.size()` bytes.
    fn serialize(&self, buf: &mut [u8]);

    /// Reconstruct a command from a region previously written by
    /// `serialize`.
    fn deserialize(buf: &[u8]) -> Self;
}

/// The application state machine driven by the replicated log.
///
/// The engine invokes all three methods while holding its replica lock:
/// `apply` is strictly single-threaded and called in increasing log-index
/// order; `apply_snapshot` replaces the entire state with a blob previously
/// produced by `snapshot`.
pub trait StateMachine: Send + 'static {
    type Command: Command;

    /// Apply one committed command.
    fn apply(&mut self, cmd: &Self::Command);

    /// Serialize the whole state into an opaque blob.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the whole state from a blob produced by `snapshot`.
    fn apply_snapshot(&mut self, bytes: &[u8]);
}
