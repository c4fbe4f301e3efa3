//! Startup recovery.
//!
//! The replayer visits every slot the bookkeeping region marked as holding
//! un-replayed data, streams the slot's blocks into memory, walks the framed
//! records, and re-applies every mutation not already covered by a table's
//! flush watermark. Records within a segment are contiguous and append-only,
//! so the first frame that fails validation marks the boundary between the
//! clean pre-crash prefix and the torn tail; scanning never continues past
//! it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::sync::WaitGroup;
use tracing::{debug, warn};

use crate::config::{ReplayPosition, SegmentId, TableId, BLOCK_SIZE};
use crate::error::CommitLogResult;
use crate::frame::{self, DecodeOutcome};
use crate::host::{HostDatabase, Mutation, TaskExecutor};
use crate::manager::SegmentManager;
use crate::metrics::CommitLogMetrics;

/// Blocks per device read while streaming a segment in (32 MiB bursts).
const REPLAY_READ_BLOCKS: u64 = 8000;

/// Outstanding apply-task bound; exceeding it drains the backlog before the
/// walk continues.
const MAX_OUTSTANDING_REPLAY: usize = 2 * 1024 * 1024;

pub struct Replayer<H: HostDatabase> {
    host: Arc<H>,
    mutation_stage: Arc<dyn TaskExecutor>,
    metrics: Arc<CommitLogMetrics>,
    table_floors: HashMap<TableId, ReplayPosition>,
    global_floor: ReplayPosition,
    replayed: Arc<AtomicU64>,
    invalid_mutations: HashMap<TableId, u64>,
    recovered_tables: HashSet<TableId>,
    outstanding: WaitGroup,
    pending: usize,
}

impl<H: HostDatabase> Replayer<H> {
    /// Compute per-table replay floors (flushed position, bumped forward by
    /// any recorded truncation) and their global minimum.
    pub fn new(
        host: Arc<H>,
        mutation_stage: Arc<dyn TaskExecutor>,
        metrics: Arc<CommitLogMetrics>,
    ) -> Self {
        let mut table_floors = HashMap::new();
        for table in host.tables() {
            let mut floor = host.flushed_position(table);
            if let Some(truncated) = host.truncated_position(table) {
                floor = floor.max(truncated);
            }
            table_floors.insert(table, floor);
        }
        let global_floor = table_floors
            .values()
            .copied()
            .min()
            .unwrap_or(ReplayPosition::NONE);
        debug!(global = %global_floor, tables = table_floors.len(), "computed replay floors");

        Self {
            host,
            mutation_stage,
            metrics,
            table_floors,
            global_floor,
            replayed: Arc::new(AtomicU64::new(0)),
            invalid_mutations: HashMap::new(),
            recovered_tables: HashSet::new(),
            outstanding: WaitGroup::new(),
            pending: 0,
        }
    }

    /// Walk every un-committed slot, dispatching surviving mutations to the
    /// mutation stage.
    pub fn recover(&mut self, manager: &SegmentManager<H>) -> CommitLogResult<()> {
        let config = manager.config().clone();
        let chunk = manager.bookkeeper();
        let segment_blocks = config.blocks_per_segment as u64;
        let read_blocks = REPLAY_READ_BLOCKS.min(segment_blocks);
        let mut reader_buf = vec![0u8; read_blocks as usize * BLOCK_SIZE];
        let mut segment_buf = vec![0u8; segment_blocks as usize * BLOCK_SIZE];

        for (slot, segment_id) in manager.un_committed_snapshot() {
            if self.global_floor.segment > segment_id {
                debug!(slot, segment = %segment_id, "skipping replay of fully-flushed slot");
                continue;
            }
            let start_block = if self.global_floor.segment < segment_id {
                0
            } else {
                self.global_floor.position
            };
            if start_block as u64 >= segment_blocks {
                continue;
            }

            // Stream the whole slot in bounded bursts; a single read of the
            // full segment would exceed sane device request sizes.
            let first_lba = config.slot_first_block(slot);
            let mut blocks_read = 0u64;
            while blocks_read < segment_blocks {
                let burst = read_blocks.min(segment_blocks - blocks_read);
                chunk.read_block(first_lba + blocks_read, burst, &mut reader_buf)?;
                let at = blocks_read as usize * BLOCK_SIZE;
                let len = burst as usize * BLOCK_SIZE;
                segment_buf[at..at + len].copy_from_slice(&reader_buf[..len]);
                blocks_read += burst;
            }

            debug!(slot, segment = %segment_id, start_block, "replaying slot");
            self.replay_slot(slot, segment_id, start_block, &segment_buf)?;
        }
        Ok(())
    }

    fn replay_slot(
        &mut self,
        slot: usize,
        segment_id: SegmentId,
        start_block: u32,
        segment_buf: &[u8],
    ) -> CommitLogResult<()> {
        let mut cursor = start_block;
        let mut records_recovered = 0u64;

        loop {
            let at = cursor as usize * BLOCK_SIZE;
            if at >= segment_buf.len() {
                break;
            }
            match frame::decode(&segment_buf[at..], segment_id) {
                DecodeOutcome::EndOfRecords => break,
                DecodeOutcome::Corrupt(reason) => {
                    self.metrics.incr_corruption_stops();
                    if records_recovered == 0 {
                        warn!(
                            slot,
                            segment = %segment_id,
                            block = cursor,
                            reason,
                            "no records recovered from corrupt slot"
                        );
                    } else {
                        debug!(
                            slot,
                            segment = %segment_id,
                            block = cursor,
                            reason,
                            records_recovered,
                            "stopping slot replay at corrupt record"
                        );
                    }
                    break;
                }
                DecodeOutcome::Valid {
                    payload,
                    block_count,
                } => {
                    let end_block = cursor + block_count;
                    let mutation = match H::Mutation::deserialize(payload) {
                        Ok(mutation) => mutation,
                        Err(err) => {
                            // Checksums passed but the payload will not
                            // deserialize; treat like a corrupt tail.
                            self.metrics.incr_corruption_stops();
                            warn!(
                                slot,
                                segment = %segment_id,
                                block = cursor,
                                error = %err,
                                "stopping slot replay at undeserializable record"
                            );
                            break;
                        }
                    };
                    self.dispatch(segment_id, end_block, mutation);
                    records_recovered += 1;
                    cursor = end_block;
                }
            }
        }
        Ok(())
    }

    /// Filter one decoded mutation against the schema and per-table floors
    /// and hand the survivors to the mutation stage.
    fn dispatch(&mut self, segment_id: SegmentId, end_block: u32, mutation: H::Mutation) {
        let position = ReplayPosition::new(segment_id, end_block);
        let mut keep = HashSet::new();
        for table in mutation.tables() {
            if !self.host.table_exists(table) {
                self.metrics.incr_invalid_mutations();
                *self.invalid_mutations.entry(table).or_insert(0) += 1;
                continue;
            }
            let floor = self
                .table_floors
                .get(&table)
                .copied()
                .unwrap_or(ReplayPosition::NONE);
            if position > floor {
                keep.insert(table);
            }
        }
        if keep.is_empty() {
            return;
        }

        let Some(filtered) = mutation.retain(&keep) else {
            return;
        };
        self.replayed
            .fetch_add(keep.len() as u64, Ordering::Relaxed);
        self.recovered_tables.extend(keep.iter().copied());

        let host = Arc::clone(&self.host);
        let guard = self.outstanding.clone();
        self.mutation_stage.execute(Box::new(move || {
            host.apply(filtered);
            drop(guard);
        }));
        self.pending += 1;
        if self.pending > MAX_OUTSTANDING_REPLAY {
            self.drain_outstanding();
        }
    }

    fn drain_outstanding(&mut self) {
        let group = std::mem::replace(&mut self.outstanding, WaitGroup::new());
        group.wait();
        self.pending = 0;
    }

    /// Wait for every dispatched apply to finish, then flush every table
    /// that received replayed mutations. Returns the number of replayed
    /// sub-mutations.
    pub fn block_for_writes(&mut self) -> u64 {
        for (table, count) in &self.invalid_mutations {
            debug!(%table, count = *count, "skipped mutations for unknown (probably dropped) table");
        }
        self.drain_outstanding();

        let mut tables: Vec<TableId> = self.recovered_tables.iter().copied().collect();
        tables.sort();
        for table in tables {
            // The host's flush entry point requests the flush on its own
            // machinery and blocks until durable; this thread only waits.
            self.host.flush(table);
        }

        let count = self.replayed.load(Ordering::Relaxed);
        self.metrics.add_replayed_records(count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{DirectExecutor, TestHost};

    fn floor<H: HostDatabase>(replayer: &Replayer<H>, table: TableId) -> ReplayPosition {
        replayer
            .table_floors
            .get(&table)
            .copied()
            .unwrap_or(ReplayPosition::NONE)
    }

    #[test]
    fn floors_take_truncation_into_account() {
        let host = Arc::new(TestHost::default());
        let a = TableId::new(1);
        let b = TableId::new(2);
        host.create_table(a);
        host.create_table(b);
        host.set_flushed_position(a, ReplayPosition::new(SegmentId::new(3), 2));
        host.set_truncated_position(a, ReplayPosition::new(SegmentId::new(5), 0));
        host.set_flushed_position(b, ReplayPosition::new(SegmentId::new(2), 9));

        let replayer = Replayer::new(
            Arc::clone(&host),
            Arc::new(DirectExecutor),
            Arc::new(CommitLogMetrics::default()),
        );
        assert_eq!(floor(&replayer, a), ReplayPosition::new(SegmentId::new(5), 0));
        assert_eq!(floor(&replayer, b), ReplayPosition::new(SegmentId::new(2), 9));
        assert_eq!(replayer.global_floor, ReplayPosition::new(SegmentId::new(2), 9));
    }

    #[test]
    fn empty_catalog_replays_from_the_beginning() {
        let host = Arc::new(TestHost::default());
        let replayer = Replayer::new(
            host,
            Arc::new(DirectExecutor),
            Arc::new(CommitLogMetrics::default()),
        );
        assert_eq!(replayer.global_floor, ReplayPosition::NONE);
    }
}
