//! Crash-consistent commit log for column-family databases on raw
//! block-addressable flash.
//!
//! Every mutation accepted by [`CommitLog::add`] is persisted as a
//! checksummed, block-aligned record before the call returns; on restart,
//! [`CommitLog::recover`] replays every record not yet covered by the host
//! database's flush watermarks. Storage is reached exclusively through a
//! [`BlockDevice`] abstraction working in whole 4 KiB blocks.
//!
//! ## Architecture Overview
//!
//! Three subsystems cooperate around a fixed on-device layout (a bookkeeping
//! region of one block per segment slot, followed by the segment data
//! region):
//!
//! - **Segment management**: a ring of fixed-size segments with
//!   block-granular allocation, per-table dirty tracking, recycling after
//!   flush, and an emergency valve that asks the host to flush the oldest
//!   tables when free slots run low.
//! - **Append pipeline**: a bounded pool of pre-allocated workers, each
//!   owning a staging buffer and a pinned device chunk; the pool size bounds
//!   in-flight appends and doubles as the "no append mid-flight" monitor.
//! - **Replay**: a startup pass over every slot whose bookkeeping block is
//!   nonzero, validating dual-checksummed frames, filtering against
//!   per-table replay floors, and fanning surviving mutations out to the
//!   host's mutation stage.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flashlog::{CommitLog, CommitLogConfig, FileBlockDevice};
//!
//! let config = CommitLogConfig::default().normalized();
//! let capacity = config.data_offset()
//!     + config.max_segments as u64 * config.blocks_per_segment as u64;
//! let device = FileBlockDevice::new(capacity);
//! let log = CommitLog::open(config, &device, host, mutation_stage, maintenance)?;
//! let replayed = log.recover()?;
//!
//! let position = log.add(&mutation)?;        // durable once this returns
//! log.discard_completed_segments(table, flushed_through)?;
//! log.shutdown()?;
//! ```
//!
//! ## Thread Safety
//!
//! A [`CommitLog`] is shared behind an `Arc`; `add` runs from any number of
//! caller threads, contending only on the worker pool and the allocator
//! lock. Flush requests and replay applies always run on executors supplied
//! by the host, never on the log's own threads.

pub mod config;
pub mod device;
pub mod error;
pub mod frame;
pub mod host;
pub mod metrics;
pub mod test_support;

mod commitlog;
mod manager;
mod replay;
mod segment;
mod worker;

pub use commitlog::CommitLog;
pub use config::{
    block_count, CommitLogConfig, ReplayPosition, SegmentId, TableId, BLOCK_SIZE,
    MIN_SERIALIZED_SIZE, RECORD_OVERHEAD,
};
pub use device::{BlockDevice, Chunk, FileBlockDevice};
pub use error::{CommitLogError, CommitLogResult};
pub use frame::DecodeOutcome;
pub use host::{HostDatabase, Mutation, TaskExecutor};
pub use manager::{Reservation, SegmentManager};
pub use metrics::{CommitLogMetrics, CommitLogMetricsSnapshot};
pub use replay::Replayer;
pub use segment::Segment;
pub use worker::{AppendWorker, WorkerPool};
