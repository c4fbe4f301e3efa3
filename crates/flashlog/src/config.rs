use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Size of one device block in bytes. All device I/O is issued in whole,
/// aligned multiples of this.
pub const BLOCK_SIZE: usize = 4096;

/// Blocks per MiB of staging buffer.
pub const BLOCKS_PER_MIB: u64 = (1024 * 1024 / BLOCK_SIZE) as u64;

/// Fixed per-record framing overhead in bytes: segment id (8), serialized
/// size (4), header checksum (8), payload checksum (8).
pub const RECORD_OVERHEAD: usize = 28;

/// Smallest `serialized_size` a valid record can carry. Anything below this
/// cannot hold the framing plus a minimal mutation payload.
pub const MIN_SERIALIZED_SIZE: u32 = 38;

/// Fewest segment slots a ring may have. One active slot plus at least one
/// spare keeps the "never recycle the last segment" rule meaningful.
const MAX_SEGMENTS_MIN_LIMIT: usize = 2;

/// Fewest blocks a segment may span.
const BLOCKS_PER_SEGMENT_MIN_LIMIT: u32 = 4;

const DEFAULT_DEVICE: &str = "./data/flashlog.dev";
const DEFAULT_MAX_SEGMENTS: usize = 32;
const DEFAULT_BLOCKS_PER_SEGMENT: u32 = 32 * 1024; // 128 MiB segments
const DEFAULT_THREADS: usize = 4;
const DEFAULT_BUFFER_MIB: usize = 1;
const DEFAULT_EMERGENCY_VALVE: f64 = 0.25;

/// Monotonic identifier assigned to a segment slot when it is activated.
///
/// Ids strictly increase over the lifetime of a log and are never reused:
/// recycling a slot and activating it again mints a fresh id. The zero id is
/// reserved; a bookkeeping block holding zero marks a free slot.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SegmentId(pub u64);

impl SegmentId {
    /// Reserved id meaning "no segment".
    pub const NONE: SegmentId = SegmentId(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next id in sequence.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for SegmentId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SegmentId> for u64 {
    #[inline]
    fn from(value: SegmentId) -> Self {
        value.0
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identifier of a column family (table) in the host database's schema.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl TableId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for TableId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A watermark into the log: a segment id plus a block offset within that
/// segment.
///
/// Positions order lexicographically (segment first, then offset), so "every
/// record at a position `<=` this one" is a meaningful durability statement
/// across segment boundaries. Mutations at positions greater than a table's
/// flush watermark may still need replay after a crash.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ReplayPosition {
    pub segment: SegmentId,
    pub position: u32,
}

impl ReplayPosition {
    /// The position preceding all real log positions.
    pub const NONE: ReplayPosition = ReplayPosition {
        segment: SegmentId::NONE,
        position: 0,
    };

    #[inline]
    pub const fn new(segment: SegmentId, position: u32) -> Self {
        Self { segment, position }
    }
}

impl Display for ReplayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.segment, self.position)
    }
}

/// Primary configuration surface for a commit log instance.
///
/// The on-device layout derived from these values is fixed for the lifetime
/// of the data: a bookkeeping region of `max_segments` blocks starting at
/// `start_offset`, followed by the data region of `max_segments *
/// blocks_per_segment` blocks. Reopening a device with different geometry is
/// undefined behavior at the format level, so treat `start_offset`,
/// `max_segments`, and `blocks_per_segment` as immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitLogConfig {
    /// Ordered device names; append workers are pinned to devices
    /// round-robin. Multiple names are multiple paths to the same storage
    /// array, not independent copies.
    pub devices: Vec<String>,

    /// First block of the bookkeeping region.
    pub start_offset: u64,

    /// Number of segment slots in the ring (`N`).
    pub max_segments: usize,

    /// Blocks per segment (`K`).
    pub blocks_per_segment: u32,

    /// Number of pre-allocated append workers (`T`); bounds in-flight
    /// appends.
    pub threads: usize,

    /// Per-worker staging buffer size in MiB (`M`); bounds the largest
    /// record one worker can stage.
    pub buffer_mib: usize,

    /// Free-list fraction below which the oldest segment's tables are asked
    /// to flush. Zero disables the valve.
    pub emergency_valve: f64,
}

impl Default for CommitLogConfig {
    fn default() -> Self {
        Self {
            devices: vec![DEFAULT_DEVICE.to_string()],
            start_offset: 0,
            max_segments: DEFAULT_MAX_SEGMENTS,
            blocks_per_segment: DEFAULT_BLOCKS_PER_SEGMENT,
            threads: DEFAULT_THREADS,
            buffer_mib: DEFAULT_BUFFER_MIB,
            emergency_valve: DEFAULT_EMERGENCY_VALVE,
        }
    }
}

impl CommitLogConfig {
    /// Returns a copy of the configuration with out-of-range values clamped
    /// into their supported windows.
    pub fn normalized(mut self) -> Self {
        if self.devices.is_empty() {
            self.devices = vec![DEFAULT_DEVICE.to_string()];
        }
        if self.max_segments < MAX_SEGMENTS_MIN_LIMIT {
            self.max_segments = MAX_SEGMENTS_MIN_LIMIT;
        }
        if self.blocks_per_segment < BLOCKS_PER_SEGMENT_MIN_LIMIT {
            self.blocks_per_segment = BLOCKS_PER_SEGMENT_MIN_LIMIT;
        }
        if self.threads == 0 {
            self.threads = 1;
        }
        if self.buffer_mib == 0 {
            self.buffer_mib = 1;
        }
        if !self.emergency_valve.is_finite() {
            self.emergency_valve = DEFAULT_EMERGENCY_VALVE;
        }
        self.emergency_valve = self.emergency_valve.clamp(0.0, 0.9);
        self
    }

    /// First block of the data region.
    #[inline]
    pub fn data_offset(&self) -> u64 {
        self.start_offset + self.max_segments as u64
    }

    /// First physical block owned by the given slot.
    #[inline]
    pub fn slot_first_block(&self, slot: usize) -> u64 {
        self.data_offset() + slot as u64 * self.blocks_per_segment as u64
    }

    /// Capacity of one worker's staging buffer, in blocks.
    #[inline]
    pub fn worker_buffer_blocks(&self) -> u64 {
        self.buffer_mib as u64 * BLOCKS_PER_MIB
    }

    /// Free-slot count below which the emergency valve fires.
    #[inline]
    pub fn valve_threshold(&self) -> f64 {
        self.max_segments as f64 * self.emergency_valve
    }
}

impl Display for CommitLogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommitLogConfig(devices={:?}, start_offset={}, max_segments={}, blocks_per_segment={}, threads={}, buffer_mib={}, emergency_valve={})",
            self.devices,
            self.start_offset,
            self.max_segments,
            self.blocks_per_segment,
            self.threads,
            self.buffer_mib,
            self.emergency_valve
        )
    }
}

/// Number of whole blocks needed to hold `bytes`.
#[inline]
pub fn block_count(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE as u64)
}
