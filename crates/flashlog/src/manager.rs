//! Segment ring management.
//!
//! The manager owns the slot ring: which slots are free, which hold live
//! segments, and which hold un-replayed data from a previous run. Slot
//! occupancy is mirrored on flash in the bookkeeping region (one block per
//! slot, holding the occupying segment id or zero), so a crash leaves an
//! exact record of which slots recovery must visit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::{CommitLogConfig, ReplayPosition, SegmentId, TableId, BLOCK_SIZE};
use crate::device::Chunk;
use crate::error::{CommitLogError, CommitLogResult};
use crate::host::{HostDatabase, TaskExecutor};
use crate::metrics::CommitLogMetrics;
use crate::segment::Segment;

/// The outcome of [`SegmentManager::allocate`]: a contiguous, exclusively
/// owned block range inside the active segment.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub segment_id: SegmentId,
    pub slot: usize,
    pub starting_block: u32,
    pub block_count: u32,
}

/// Blocking free-list of slot indices.
struct FreeList {
    slots: Mutex<VecDeque<usize>>,
    slot_freed: Condvar,
}

impl FreeList {
    fn new(slots: VecDeque<usize>) -> Self {
        Self {
            slots: Mutex::new(slots),
            slot_freed: Condvar::new(),
        }
    }

    /// Take a slot, blocking while none is free.
    fn take(&self) -> usize {
        let mut slots = self.slots.lock();
        loop {
            if let Some(slot) = slots.pop_front() {
                return slot;
            }
            self.slot_freed.wait(&mut slots);
        }
    }

    fn put(&self, slot: usize) {
        let mut slots = self.slots.lock();
        slots.push_back(slot);
        self.slot_freed.notify_one();
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn snapshot(&self) -> Vec<usize> {
        self.slots.lock().iter().copied().collect()
    }
}

struct ManagerState {
    /// Live segments, oldest first. The back element is the active segment.
    active_segments: VecDeque<Arc<Segment>>,
    active: Option<Arc<Segment>>,
    next_id: SegmentId,
    /// Slots found occupied at startup, pending replay: slot -> segment id.
    un_committed: HashMap<usize, SegmentId>,
    /// One-block utility buffer for bookkeeping writes. Owned strictly by
    /// the lock holder and reset on every use.
    util: Vec<u8>,
}

/// Single instance per log. All ring mutations are serialized under one
/// lock; the free-list take inside activation is the only wait performed
/// while holding it, and the emergency valve exists to keep that wait from
/// becoming unbounded.
pub struct SegmentManager<H: HostDatabase> {
    config: CommitLogConfig,
    bookkeeper: Arc<dyn Chunk>,
    host: Arc<H>,
    maintenance: Arc<dyn TaskExecutor>,
    metrics: Arc<CommitLogMetrics>,
    free_list: FreeList,
    state: Mutex<ManagerState>,
}

impl<H: HostDatabase> SegmentManager<H> {
    /// Scan the bookkeeping region and split slots into free and
    /// un-replayed.
    pub fn open(
        config: CommitLogConfig,
        bookkeeper: Arc<dyn Chunk>,
        host: Arc<H>,
        maintenance: Arc<dyn TaskExecutor>,
        metrics: Arc<CommitLogMetrics>,
    ) -> CommitLogResult<Self> {
        let slots = config.max_segments;
        let mut region = vec![0u8; slots * BLOCK_SIZE];
        bookkeeper.read_block(config.start_offset, slots as u64, &mut region)?;

        let mut un_committed = HashMap::new();
        let mut free = VecDeque::new();
        let mut max_seen = 0u64;
        for slot in 0..slots {
            let id = LittleEndian::read_u64(&region[slot * BLOCK_SIZE..slot * BLOCK_SIZE + 8]);
            if id != 0 {
                debug!(slot, segment = id, "slot holds un-replayed data");
                un_committed.insert(slot, SegmentId::new(id));
                max_seen = max_seen.max(id);
            } else {
                free.push_back(slot);
            }
        }

        // No segment is activated here: the first allocation does that, so a
        // log that is only ever recovered leaves the ring untouched.
        Ok(Self {
            config,
            bookkeeper,
            host,
            maintenance,
            metrics,
            free_list: FreeList::new(free),
            state: Mutex::new(ManagerState {
                active_segments: VecDeque::new(),
                active: None,
                next_id: SegmentId::new(max_seen + 1),
                un_committed,
                util: vec![0u8; BLOCK_SIZE],
            }),
        })
    }

    /// Activate a fresh segment: valve check, free-slot take, id mint,
    /// bookkeeping write. Caller holds the manager lock.
    fn activate_next_segment(&self, state: &mut ManagerState) -> CommitLogResult<()> {
        if (self.free_list.len() as f64) < self.config.valve_threshold() {
            debug!(
                free = self.free_list.len(),
                threshold = self.config.valve_threshold(),
                "emergency valve: requesting flush of oldest segment's tables"
            );
            self.flush_oldest_tables(state);
        }

        let slot = self.free_list.take();
        let id = state.next_id;
        state.next_id = id.next();

        state.util.fill(0);
        LittleEndian::write_u64(&mut state.util[0..8], id.as_u64());
        self.bookkeeper
            .write_block(self.config.start_offset + slot as u64, 1, &state.util)?;

        let segment = Arc::new(Segment::new(id, slot, self.config.blocks_per_segment));
        debug!(segment = %id, slot, "activated segment");
        state.active_segments.push_back(Arc::clone(&segment));
        state.active = Some(segment);
        self.metrics.incr_segments_activated();
        Ok(())
    }

    /// Reserve `block_count` contiguous blocks for a record touching
    /// `tables`, rolling over to a fresh segment when the active one lacks
    /// capacity. The caller has already bounded `block_count` by the segment
    /// capacity.
    pub fn allocate(
        &self,
        block_count: u64,
        tables: &[TableId],
    ) -> CommitLogResult<Reservation> {
        let mut state = self.state.lock();
        let needs_rollover = match &state.active {
            Some(active) => !active.has_capacity_for(block_count),
            None => true,
        };
        if needs_rollover {
            self.activate_next_segment(&mut state)?;
        }
        let active = state
            .active
            .as_ref()
            .ok_or_else(|| CommitLogError::InvalidState("no active segment".to_string()))?;
        let starting_block = active.reserve(block_count as u32).ok_or_else(|| {
            CommitLogError::InvalidState("freshly activated segment lacks capacity".to_string())
        })?;
        active.mark_dirty(tables, starting_block);
        Ok(Reservation {
            segment_id: active.id(),
            slot: active.slot(),
            starting_block,
            block_count: block_count as u32,
        })
    }

    /// For every table dirty in the oldest non-active segment, enqueue a
    /// flush request on the maintenance executor. Tables that vanished from
    /// the schema are marked clean directly: an append can race a table drop
    /// and land after the drop's final flush, and no future flush would ever
    /// clean it.
    fn flush_oldest_tables(&self, state: &ManagerState) {
        let oldest = match state.active_segments.front() {
            Some(segment) => Arc::clone(segment),
            None => return,
        };
        if let Some(active) = &state.active {
            if Arc::ptr_eq(&oldest, active) {
                return;
            }
        }
        for table in oldest.dirty_tables() {
            if !self.host.table_exists(table) {
                debug!(%table, "marking clean table that no longer exists");
                oldest.mark_clean_unconditionally(table);
                continue;
            }
            let host = Arc::clone(&self.host);
            self.metrics.incr_emergency_flush_requests();
            self.maintenance
                .execute(Box::new(move || host.flush(table)));
        }
    }

    /// Zero the slot's bookkeeping block and return it to the free-list.
    /// The caller has verified the segment is unused and not the active one.
    pub fn recycle_segment(&self, segment: &Arc<Segment>) -> CommitLogResult<()> {
        let mut state = self.state.lock();
        self.recycle_locked(&mut state, segment)
    }

    fn recycle_locked(
        &self,
        state: &mut ManagerState,
        segment: &Arc<Segment>,
    ) -> CommitLogResult<()> {
        let before = state.active_segments.len();
        state
            .active_segments
            .retain(|candidate| !Arc::ptr_eq(candidate, segment));
        if state.active_segments.len() == before {
            return Err(CommitLogError::InvalidState(format!(
                "segment {} is not in the active list",
                segment.id()
            )));
        }

        state.util.fill(0);
        self.bookkeeper.write_block(
            self.config.start_offset + segment.slot() as u64,
            1,
            &state.util,
        )?;
        self.free_list.put(segment.slot());
        self.metrics.incr_segments_recycled();
        debug!(segment = %segment.id(), slot = segment.slot(), "recycled segment");
        Ok(())
    }

    /// Mark all segments clean for each dropped table, then recycle every
    /// unused segment other than the active one.
    pub fn force_recycle_all(&self, dropped_tables: &[TableId]) -> CommitLogResult<()> {
        let mut state = self.state.lock();
        for segment in state.active_segments.iter() {
            for &table in dropped_tables {
                segment.mark_clean_unconditionally(table);
            }
        }
        let candidates: Vec<Arc<Segment>> = state.active_segments.iter().cloned().collect();
        for segment in candidates {
            let is_active = state
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &segment));
            if !is_active && segment.is_unused() {
                self.recycle_locked(&mut state, &segment)?;
            }
        }
        Ok(())
    }

    /// Zero every bookkeeping block recorded in the un-committed map, return
    /// the slots to the free-list, and clear the map. Runs once, after the
    /// replayer has finished with the slots.
    pub fn recycle_after_replay(&self) -> CommitLogResult<()> {
        let mut state = self.state.lock();
        let slots: Vec<usize> = state.un_committed.keys().copied().collect();
        for slot in slots {
            state.util.fill(0);
            self.bookkeeper
                .write_block(self.config.start_offset + slot as u64, 1, &state.util)?;
            self.free_list.put(slot);
            debug!(slot, "slot returned to free-list after replay");
        }
        state.un_committed.clear();
        Ok(())
    }

    /// Un-replayed slots, ordered by segment id so replay applies mutations
    /// in the order they were logged.
    pub fn un_committed_snapshot(&self) -> Vec<(usize, SegmentId)> {
        let state = self.state.lock();
        let mut slots: Vec<(usize, SegmentId)> =
            state.un_committed.iter().map(|(&k, &v)| (k, v)).collect();
        slots.sort_by_key(|&(_, id)| id);
        slots
    }

    /// The active segment's replay position.
    pub fn active_context(&self) -> ReplayPosition {
        let state = self.state.lock();
        state
            .active
            .as_ref()
            .map(|segment| segment.context())
            .unwrap_or(ReplayPosition::NONE)
    }

    /// Live segments, oldest first.
    pub fn active_segments(&self) -> Vec<Arc<Segment>> {
        self.state.lock().active_segments.iter().cloned().collect()
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_list.len()
    }

    /// Free slot indices, for bookkeeping consistency checks.
    pub fn free_slots(&self) -> Vec<usize> {
        self.free_list.snapshot()
    }

    pub fn bookkeeper(&self) -> Arc<dyn Chunk> {
        Arc::clone(&self.bookkeeper)
    }

    pub fn config(&self) -> &CommitLogConfig {
        &self.config
    }

    pub fn close(&self) -> CommitLogResult<()> {
        if let Err(err) = self.bookkeeper.close() {
            warn!(error = %err, "failed to close bookkeeping chunk");
            return Err(err);
        }
        Ok(())
    }
}
