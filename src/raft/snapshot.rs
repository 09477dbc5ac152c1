use crate::error::Result;
use crate::storage::event::SerializedObject;

/// Maximum number of chunks carried by one InstallSnapshot request.
pub const SNAPSHOT_CHUNKS_BUFFER_SIZE: usize = 10;

/// Lazily produced snapshot chunks. Dropping the iterator cancels the stream.
pub type SnapshotChunks = Box<dyn Iterator<Item = Result<SerializedObject>> + Send>;

/// Produces and installs the application state replicated by a group.
///
/// Positions are application sequence numbers, for an event store the token
/// of the events.
pub trait SnapshotManager: Send + Sync {
    /// Last sequence captured by the local state, -1 when empty.
    fn last_sequence(&self) -> i64;

    /// Chunks covering `from_sequence..=to_sequence`. Every call starts a new
    /// stream.
    fn stream_snapshot_chunks(&self, from_sequence: i64, to_sequence: i64) -> SnapshotChunks;

    fn apply_snapshot_data(&self, chunk: &SerializedObject) -> Result<()>;

    /// Removes all local state, before a snapshot from the beginning is installed.
    fn clear(&self) -> Result<()>;
}

/// Snapshot manager of groups without application state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotManager;

impl SnapshotManager for NoopSnapshotManager {
    fn last_sequence(&self) -> i64 {
        -1
    }

    fn stream_snapshot_chunks(&self, _from_sequence: i64, _to_sequence: i64) -> SnapshotChunks {
        Box::new(std::iter::empty())
    }

    fn apply_snapshot_data(&self, _chunk: &SerializedObject) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}
