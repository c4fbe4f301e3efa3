//! The commit log facade.
//!
//! One [`CommitLog`] instance owns the segment manager, the worker pool, and
//! the append executor. Construct it explicitly with [`CommitLog::open`] and
//! tear it down with [`CommitLog::shutdown`]; callers share it behind an
//! `Arc`. There is deliberately no process-wide instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{CommitLogConfig, ReplayPosition, TableId};
use crate::device::{BlockDevice, Chunk};
use crate::error::{CommitLogError, CommitLogResult};
use crate::frame;
use crate::host::{HostDatabase, Mutation, TaskExecutor};
use crate::manager::SegmentManager;
use crate::metrics::{CommitLogMetrics, CommitLogMetricsSnapshot};
use crate::replay::Replayer;
use crate::worker::{AppendExecutor, AppendWorker, WorkerPool};

pub struct CommitLog<H: HostDatabase> {
    config: CommitLogConfig,
    manager: SegmentManager<H>,
    pool: WorkerPool,
    executor: AppendExecutor,
    host: Arc<H>,
    mutation_stage: Arc<dyn TaskExecutor>,
    metrics: Arc<CommitLogMetrics>,
    closed: AtomicBool,
}

impl<H: HostDatabase> CommitLog<H> {
    /// Open the log: scan the bookkeeping region and pre-allocate the append
    /// workers (pinned to the configured devices round-robin). No segment is
    /// activated until the first append asks for space.
    ///
    /// Call [`CommitLog::recover`] before the first `add` when the device
    /// may hold un-replayed data from a previous run.
    pub fn open(
        config: CommitLogConfig,
        device: &dyn BlockDevice,
        host: Arc<H>,
        mutation_stage: Arc<dyn TaskExecutor>,
        maintenance: Arc<dyn TaskExecutor>,
    ) -> CommitLogResult<Self> {
        let config = config.normalized();
        let metrics = Arc::new(CommitLogMetrics::default());
        let bookkeeper: Arc<dyn Chunk> = Arc::from(device.open_chunk(&config.devices[0])?);
        let manager = SegmentManager::open(
            config.clone(),
            bookkeeper,
            Arc::clone(&host),
            maintenance,
            Arc::clone(&metrics),
        )?;

        let mut workers = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let name = &config.devices[index % config.devices.len()];
            let chunk = device.open_chunk(name)?;
            workers.push(AppendWorker::new(chunk, config.worker_buffer_blocks()));
        }
        let pool = WorkerPool::new(workers);
        let executor = AppendExecutor::new(config.threads)?;

        debug!(%config, "commit log opened");
        Ok(Self {
            config,
            manager,
            pool,
            executor,
            host,
            mutation_stage,
            metrics,
            closed: AtomicBool::new(false),
        })
    }

    /// Append a mutation, returning once the framed record has been accepted
    /// by the device.
    ///
    /// Returns the active segment's replay position, or `None` when the
    /// mutation is too large for a segment or a worker's staging buffer (the
    /// record is not written; nothing else changes).
    pub fn add(&self, mutation: &H::Mutation) -> CommitLogResult<Option<ReplayPosition>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommitLogError::Shutdown);
        }

        let payload_len = mutation.serialized_size();
        let blocks = frame::framed_block_count(payload_len);
        if blocks > self.config.blocks_per_segment as u64
            || blocks > self.config.worker_buffer_blocks()
        {
            warn!(
                blocks,
                "skipping commit log append of extremely large mutation"
            );
            self.metrics.incr_oversize_rejected();
            return Ok(None);
        }

        let mut worker = self.pool.take();
        let staged = self
            .manager
            .allocate(blocks, &mutation.tables())
            .and_then(|reservation| {
                let lba = self.config.slot_first_block(reservation.slot)
                    + reservation.starting_block as u64;
                worker.stage_with(reservation.segment_id, payload_len, lba, |dst| {
                    mutation.serialize_into(dst)
                })
            });
        if let Err(err) = staged {
            self.pool.put(worker);
            return Err(err);
        }

        let (worker, write_result) = match self.executor.submit(worker) {
            Ok(round_trip) => round_trip,
            // The worker is lost with the executor; only shutdown does this.
            Err(err) => return Err(err),
        };
        self.pool.put(worker);
        write_result?;
        self.metrics.incr_appends();
        Ok(Some(self.manager.active_context()))
    }

    /// Mark every segment up to the one containing `position` clean for
    /// `table`, recycling segments that become unused. Called by the host
    /// after it has flushed the table's in-memory data through `position`.
    pub fn discard_completed_segments(
        &self,
        table: TableId,
        position: ReplayPosition,
    ) -> CommitLogResult<()> {
        // Recycling decisions read the dirty maps, which are only consistent
        // while no append is mid-flight.
        self.pool.wait_all_idle();

        let segments = self.manager.active_segments();
        let last = segments.len().saturating_sub(1);
        for (index, segment) in segments.iter().enumerate() {
            segment.mark_clean(table, position);
            if index < last {
                if segment.is_unused() {
                    debug!(segment = %segment.id(), "commit log segment is unused");
                    self.manager.recycle_segment(segment)?;
                } else {
                    debug!(
                        segment = %segment.id(),
                        dirty = ?segment.dirty_tables(),
                        "not safe to recycle commit log segment"
                    );
                }
            } else {
                debug!(segment = %segment.id(), "not recycling active segment");
            }
            if segment.contains(position) {
                break;
            }
        }
        Ok(())
    }

    /// Replay every un-committed slot, then return the slots to the
    /// free-list. Returns the number of replayed sub-mutations. Run this
    /// before the log accepts new appends.
    pub fn recover(&self) -> CommitLogResult<u64> {
        let mut replayer = Replayer::new(
            Arc::clone(&self.host),
            Arc::clone(&self.mutation_stage),
            Arc::clone(&self.metrics),
        );
        replayer.recover(&self.manager)?;
        let count = replayer.block_for_writes();
        self.manager.recycle_after_replay()?;
        debug!(count, "replay finished");
        Ok(count)
    }

    /// The current replay position, observed with no append in flight.
    pub fn get_context(&self) -> ReplayPosition {
        self.pool.wait_all_idle();
        self.manager.active_context()
    }

    /// Mark all segments clean for each dropped table and recycle everything
    /// that is now unused (except the active segment).
    pub fn force_recycle_all_segments(&self, dropped_tables: &[TableId]) -> CommitLogResult<()> {
        self.pool.wait_all_idle();
        self.manager.force_recycle_all(dropped_tables)
    }

    /// Appends currently in flight.
    pub fn pending_appends(&self) -> usize {
        self.pool.capacity() - self.pool.idle_count()
    }

    pub fn metrics(&self) -> CommitLogMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting work, drain in-flight appends, stop the executor, and
    /// close every device handle. Idempotent.
    pub fn shutdown(&self) -> CommitLogResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let workers = self.pool.drain();
        self.executor.shutdown();
        let mut close_result = Ok(());
        for worker in workers {
            if let Err(err) = worker.close() {
                warn!(error = %err, "failed to close worker chunk");
                close_result = Err(err);
            }
            // Closed workers go back on the pool so idle-waiters observe a
            // full pool rather than blocking forever.
            self.pool.put(worker);
        }
        self.manager.close()?;
        debug!("commit log shut down");
        close_result
    }
}
