use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::config::{ReplayPosition, SegmentId, TableId};

/// One activated slot of the segment ring.
///
/// The write cursor only ever advances; allocation order within a segment is
/// total and contiguous. The dirty map tracks, per table, the starting block
/// offset of the newest record that is not yet covered by a flush watermark;
/// a segment with an empty dirty map holds nothing the database still needs
/// and may be recycled once it is no longer the active segment.
pub struct Segment {
    id: SegmentId,
    slot: usize,
    blocks: u32,
    cursor: AtomicU32,
    dirty: Mutex<HashMap<TableId, u32>>,
}

impl Segment {
    pub fn new(id: SegmentId, slot: usize, blocks: u32) -> Self {
        Self {
            id,
            slot,
            blocks,
            cursor: AtomicU32::new(0),
            dirty: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn has_capacity_for(&self, blocks: u64) -> bool {
        self.cursor.load(Ordering::Acquire) as u64 + blocks <= self.blocks as u64
    }

    /// Reserve `blocks` contiguous blocks, returning the starting offset.
    /// Returns `None` when the segment lacks capacity. Callers serialize
    /// reservations under the manager lock.
    pub fn reserve(&self, blocks: u32) -> Option<u32> {
        let limit = self.blocks;
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(blocks).filter(|&next| next <= limit)
            })
            .ok()
    }

    /// The segment's current replay position: its id plus the write cursor.
    #[inline]
    pub fn context(&self) -> ReplayPosition {
        ReplayPosition::new(self.id, self.cursor.load(Ordering::Acquire))
    }

    /// Record that the tables have un-flushed data whose newest record starts
    /// at `at`.
    pub fn mark_dirty(&self, tables: &[TableId], at: u32) {
        let mut dirty = self.dirty.lock();
        for &table in tables {
            let entry = dirty.entry(table).or_insert(at);
            if *entry < at {
                *entry = at;
            }
        }
    }

    /// Drop the table from the dirty map if `watermark` covers its newest
    /// dirty record.
    pub fn mark_clean(&self, table: TableId, watermark: ReplayPosition) {
        let mut dirty = self.dirty.lock();
        let covered = match dirty.get(&table) {
            None => return,
            Some(&at) => {
                watermark.segment > self.id
                    || (watermark.segment == self.id && watermark.position >= at)
            }
        };
        if covered {
            dirty.remove(&table);
        }
    }

    /// Drop the table from the dirty map unconditionally. Used when the
    /// table no longer exists in the schema.
    pub fn mark_clean_unconditionally(&self, table: TableId) {
        self.dirty.lock().remove(&table);
    }

    #[inline]
    pub fn is_unused(&self) -> bool {
        self.dirty.lock().is_empty()
    }

    /// Whether the given position lies in this segment.
    #[inline]
    pub fn contains(&self, position: ReplayPosition) -> bool {
        position.segment == self.id
    }

    /// Snapshot of the tables currently dirty in this segment.
    pub fn dirty_tables(&self) -> Vec<TableId> {
        self.dirty.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Segment {
        Segment::new(SegmentId::new(7), 2, 8)
    }

    #[test]
    fn reserve_advances_until_full() {
        let seg = segment();
        assert_eq!(seg.reserve(3), Some(0));
        assert_eq!(seg.reserve(3), Some(3));
        assert!(seg.has_capacity_for(2));
        assert!(!seg.has_capacity_for(3));
        assert_eq!(seg.reserve(3), None);
        assert_eq!(seg.reserve(2), Some(6));
        assert_eq!(seg.context(), ReplayPosition::new(SegmentId::new(7), 8));
    }

    #[test]
    fn dirty_tracks_newest_record_start() {
        let seg = segment();
        let table = TableId::new(1);
        seg.mark_dirty(&[table], 0);
        seg.mark_dirty(&[table], 4);
        seg.mark_dirty(&[table], 2); // stale position must not regress

        // A watermark before the newest dirty record does not clean.
        seg.mark_clean(table, ReplayPosition::new(SegmentId::new(7), 3));
        assert!(!seg.is_unused());

        // A watermark at the newest record's start does.
        seg.mark_clean(table, ReplayPosition::new(SegmentId::new(7), 4));
        assert!(seg.is_unused());
    }

    #[test]
    fn later_segment_watermark_cleans() {
        let seg = segment();
        let table = TableId::new(9);
        seg.mark_dirty(&[table], 6);
        seg.mark_clean(table, ReplayPosition::new(SegmentId::new(8), 0));
        assert!(seg.is_unused());
    }

    #[test]
    fn earlier_segment_watermark_does_not_clean() {
        let seg = segment();
        let table = TableId::new(9);
        seg.mark_dirty(&[table], 0);
        seg.mark_clean(table, ReplayPosition::new(SegmentId::new(6), 100));
        assert!(!seg.is_unused());
    }

    #[test]
    fn contains_matches_segment_id_only() {
        let seg = segment();
        assert!(seg.contains(ReplayPosition::new(SegmentId::new(7), 0)));
        assert!(!seg.contains(ReplayPosition::new(SegmentId::new(8), 0)));
    }
}
