use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the log's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitLogMetricsSnapshot {
    pub appends: u64,
    pub oversize_rejected: u64,
    pub segments_activated: u64,
    pub segments_recycled: u64,
    pub emergency_flush_requests: u64,
    pub replayed_records: u64,
    pub invalid_mutations: u64,
    pub corruption_stops: u64,
}

/// Counters for the append path, segment lifecycle, and replay.
///
/// All counters are monotone and updated with relaxed ordering; readers take
/// a [`CommitLogMetricsSnapshot`].
#[derive(Default)]
pub struct CommitLogMetrics {
    appends: AtomicU64,
    oversize_rejected: AtomicU64,
    segments_activated: AtomicU64,
    segments_recycled: AtomicU64,
    emergency_flush_requests: AtomicU64,
    replayed_records: AtomicU64,
    invalid_mutations: AtomicU64,
    corruption_stops: AtomicU64,
}

impl CommitLogMetrics {
    #[inline]
    pub fn incr_appends(&self) {
        self.appends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_oversize_rejected(&self) {
        self.oversize_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_segments_activated(&self) {
        self.segments_activated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_segments_recycled(&self) {
        self.segments_recycled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_emergency_flush_requests(&self) {
        self.emergency_flush_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_replayed_records(&self, count: u64) {
        if count > 0 {
            self.replayed_records.fetch_add(count, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn incr_invalid_mutations(&self) {
        self.invalid_mutations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_corruption_stops(&self) {
        self.corruption_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CommitLogMetricsSnapshot {
        CommitLogMetricsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            oversize_rejected: self.oversize_rejected.load(Ordering::Relaxed),
            segments_activated: self.segments_activated.load(Ordering::Relaxed),
            segments_recycled: self.segments_recycled.load(Ordering::Relaxed),
            emergency_flush_requests: self.emergency_flush_requests.load(Ordering::Relaxed),
            replayed_records: self.replayed_records.load(Ordering::Relaxed),
            invalid_mutations: self.invalid_mutations.load(Ordering::Relaxed),
            corruption_stops: self.corruption_stops.load(Ordering::Relaxed),
        }
    }
}
