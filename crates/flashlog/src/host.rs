//! Boundary to the host database.
//!
//! The log treats mutation payloads as opaque bytes on the append path; the
//! replay path additionally needs to look inside a mutation to drop
//! sub-mutations for tables that were flushed past the record or dropped
//! from the schema. Flush work and replay applies are always handed to
//! executors owned by the host, never run on the log's own threads, where
//! they would deadlock against locks held by callers of `add`.

use std::collections::HashSet;

use crate::config::{ReplayPosition, TableId};
use crate::error::CommitLogResult;

/// A database mutation, serializable to an opaque payload and decomposable
/// into per-table sub-mutations.
pub trait Mutation: Send + Sync + Sized + 'static {
    /// Exact length of the serialized payload.
    fn serialized_size(&self) -> usize;

    /// Serialize into `out`, which is exactly `serialized_size()` bytes.
    fn serialize_into(&self, out: &mut [u8]) -> CommitLogResult<()>;

    fn deserialize(bytes: &[u8]) -> CommitLogResult<Self>;

    /// Tables touched by this mutation.
    fn tables(&self) -> Vec<TableId>;

    /// A copy containing only the sub-mutations for `keep`, or `None` when
    /// nothing remains.
    fn retain(&self, keep: &HashSet<TableId>) -> Option<Self>;
}

/// Schema, flush watermarks, and the apply/flush entry points the replayer
/// and the emergency valve need.
pub trait HostDatabase: Send + Sync + 'static {
    type Mutation: Mutation;

    /// Whether the table still exists in the schema.
    fn table_exists(&self, table: TableId) -> bool;

    /// Every table currently in the schema.
    fn tables(&self) -> Vec<TableId>;

    /// Position up to which the table's data is already persisted in on-disk
    /// tables; records at or before it never need replay.
    fn flushed_position(&self, table: TableId) -> ReplayPosition;

    /// Recorded truncation point, if the table was truncated after its last
    /// flush.
    fn truncated_position(&self, table: TableId) -> Option<ReplayPosition>;

    /// Apply a replayed mutation. Must not write back to the commit log.
    fn apply(&self, mutation: Self::Mutation);

    /// Flush the table's in-memory data to on-disk tables, blocking until
    /// durable.
    fn flush(&self, table: TableId);
}

/// An executor owned by the host. The log submits fire-and-forget tasks;
/// completion tracking, when needed, is woven into the task itself.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}
