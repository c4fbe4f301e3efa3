//! Deterministic fakes for exercising the log without real flash hardware:
//! an in-memory block device with corruption helpers, a scriptable host
//! database, and task executors with observable behavior.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::config::{CommitLogConfig, ReplayPosition, TableId, BLOCK_SIZE};
use crate::device::{BlockDevice, Chunk};
use crate::error::{CommitLogError, CommitLogResult};
use crate::host::{HostDatabase, Mutation, TaskExecutor};

/// In-memory device. Every chunk opened from it, under any name, shares one
/// backing store, modeling the production setup where multiple device names
/// are multiple paths to the same flash array.
#[derive(Clone)]
pub struct MemoryBlockDevice {
    store: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBlockDevice {
    pub fn new(capacity_blocks: u64) -> Self {
        Self {
            store: Arc::new(Mutex::new(vec![0u8; capacity_blocks as usize * BLOCK_SIZE])),
        }
    }

    /// A device sized to hold the config's bookkeeping and data regions.
    pub fn for_config(config: &CommitLogConfig) -> Self {
        let blocks = config.data_offset()
            + config.max_segments as u64 * config.blocks_per_segment as u64;
        Self::new(blocks)
    }

    /// Raw copy of `blocks` blocks starting at `lba`.
    pub fn read_raw(&self, lba: u64, blocks: u64) -> Vec<u8> {
        let store = self.store.lock();
        let at = lba as usize * BLOCK_SIZE;
        store[at..at + blocks as usize * BLOCK_SIZE].to_vec()
    }

    /// Flip one byte on "flash", bypassing the chunk interface.
    pub fn corrupt(&self, lba: u64, offset_in_block: usize) {
        let mut store = self.store.lock();
        store[lba as usize * BLOCK_SIZE + offset_in_block] ^= 0xFF;
    }

    /// Plant a segment id in a slot's bookkeeping block, as a previous run
    /// would have left it.
    pub fn write_bookkeeping_id(&self, config: &CommitLogConfig, slot: usize, id: u64) {
        let mut store = self.store.lock();
        let at = (config.start_offset as usize + slot) * BLOCK_SIZE;
        store[at..at + BLOCK_SIZE].fill(0);
        LittleEndian::write_u64(&mut store[at..at + 8], id);
    }

    /// The segment id each bookkeeping block currently holds.
    pub fn bookkeeping_ids(&self, config: &CommitLogConfig) -> Vec<u64> {
        let store = self.store.lock();
        (0..config.max_segments)
            .map(|slot| {
                let at = (config.start_offset as usize + slot) * BLOCK_SIZE;
                LittleEndian::read_u64(&store[at..at + 8])
            })
            .collect()
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn open_chunk(&self, _name: &str) -> CommitLogResult<Box<dyn Chunk>> {
        Ok(Box::new(MemoryChunk {
            store: Arc::clone(&self.store),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChunk {
    store: Arc<Mutex<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryChunk {
    fn check(&self, start_lba: u64, blocks: u64, buf_len: usize) -> CommitLogResult<(usize, usize)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CommitLogError::InvalidState("chunk is closed".to_string()));
        }
        let bytes = blocks as usize * BLOCK_SIZE;
        if buf_len < bytes {
            return Err(CommitLogError::UnalignedTransfer(format!(
                "{blocks}-block transfer needs {bytes} bytes, buffer holds {buf_len}"
            )));
        }
        Ok((start_lba as usize * BLOCK_SIZE, bytes))
    }
}

impl Chunk for MemoryChunk {
    fn read_block(&self, start_lba: u64, blocks: u64, buf: &mut [u8]) -> CommitLogResult<()> {
        let (at, bytes) = self.check(start_lba, blocks, buf.len())?;
        let store = self.store.lock();
        if at + bytes > store.len() {
            return Err(CommitLogError::UnalignedTransfer(format!(
                "read of {blocks} blocks at {start_lba} runs past device end"
            )));
        }
        buf[..bytes].copy_from_slice(&store[at..at + bytes]);
        Ok(())
    }

    fn write_block(&self, start_lba: u64, blocks: u64, buf: &[u8]) -> CommitLogResult<()> {
        let (at, bytes) = self.check(start_lba, blocks, buf.len())?;
        let mut store = self.store.lock();
        if at + bytes > store.len() {
            return Err(CommitLogError::UnalignedTransfer(format!(
                "write of {blocks} blocks at {start_lba} runs past device end"
            )));
        }
        store[at..at + bytes].copy_from_slice(&buf[..bytes]);
        Ok(())
    }

    fn close(&self) -> CommitLogResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// A mutation of one or more per-table rows, with a self-describing wire
/// format: row count, then `(table id, payload length, payload)` per row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMutation {
    pub rows: Vec<(TableId, Vec<u8>)>,
}

impl TestMutation {
    pub fn new(rows: Vec<(TableId, Vec<u8>)>) -> Self {
        Self { rows }
    }

    /// Single-row mutation with a deterministic payload of `len` bytes.
    pub fn single(table: TableId, len: usize) -> Self {
        let payload = (0..len).map(|i| (i % 251) as u8).collect();
        Self::new(vec![(table, payload)])
    }
}

impl Mutation for TestMutation {
    fn serialized_size(&self) -> usize {
        4 + self
            .rows
            .iter()
            .map(|(_, payload)| 12 + payload.len())
            .sum::<usize>()
    }

    fn serialize_into(&self, out: &mut [u8]) -> CommitLogResult<()> {
        if out.len() != self.serialized_size() {
            return Err(CommitLogError::serialization(format!(
                "buffer of {} bytes for mutation of {}",
                out.len(),
                self.serialized_size()
            )));
        }
        BigEndian::write_u32(&mut out[0..4], self.rows.len() as u32);
        let mut at = 4;
        for (table, payload) in &self.rows {
            BigEndian::write_u64(&mut out[at..at + 8], table.as_u64());
            BigEndian::write_u32(&mut out[at + 8..at + 12], payload.len() as u32);
            out[at + 12..at + 12 + payload.len()].copy_from_slice(payload);
            at += 12 + payload.len();
        }
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> CommitLogResult<Self> {
        if bytes.len() < 4 {
            return Err(CommitLogError::serialization("mutation shorter than header"));
        }
        let count = BigEndian::read_u32(&bytes[0..4]) as usize;
        let mut rows = Vec::with_capacity(count);
        let mut at = 4;
        for _ in 0..count {
            if at + 12 > bytes.len() {
                return Err(CommitLogError::serialization("truncated mutation row"));
            }
            let table = TableId::new(BigEndian::read_u64(&bytes[at..at + 8]));
            let len = BigEndian::read_u32(&bytes[at + 8..at + 12]) as usize;
            if at + 12 + len > bytes.len() {
                return Err(CommitLogError::serialization("truncated row payload"));
            }
            rows.push((table, bytes[at + 12..at + 12 + len].to_vec()));
            at += 12 + len;
        }
        Ok(Self { rows })
    }

    fn tables(&self) -> Vec<TableId> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .map(|(table, _)| *table)
            .filter(|table| seen.insert(*table))
            .collect()
    }

    fn retain(&self, keep: &HashSet<TableId>) -> Option<Self> {
        let rows: Vec<(TableId, Vec<u8>)> = self
            .rows
            .iter()
            .filter(|(table, _)| keep.contains(table))
            .cloned()
            .collect();
        if rows.is_empty() {
            None
        } else {
            Some(Self { rows })
        }
    }
}

/// Scriptable host database: a schema, per-table watermarks, and logs of
/// every apply and flush the log hands it.
#[derive(Default)]
pub struct TestHost {
    tables: Mutex<HashSet<TableId>>,
    flushed: Mutex<HashMap<TableId, ReplayPosition>>,
    truncated: Mutex<HashMap<TableId, ReplayPosition>>,
    applied: Mutex<Vec<TestMutation>>,
    flush_calls: Mutex<Vec<TableId>>,
}

impl TestHost {
    pub fn with_tables(tables: &[TableId]) -> Self {
        let host = Self::default();
        for &table in tables {
            host.create_table(table);
        }
        host
    }

    pub fn create_table(&self, table: TableId) {
        self.tables.lock().insert(table);
    }

    pub fn drop_table(&self, table: TableId) {
        self.tables.lock().remove(&table);
    }

    pub fn set_flushed_position(&self, table: TableId, position: ReplayPosition) {
        self.flushed.lock().insert(table, position);
    }

    pub fn set_truncated_position(&self, table: TableId, position: ReplayPosition) {
        self.truncated.lock().insert(table, position);
    }

    /// Mutations applied during replay, in application order.
    pub fn applied(&self) -> Vec<TestMutation> {
        self.applied.lock().clone()
    }

    /// Tables the log asked to flush, in request order.
    pub fn flush_calls(&self) -> Vec<TableId> {
        self.flush_calls.lock().clone()
    }
}

impl HostDatabase for TestHost {
    type Mutation = TestMutation;

    fn table_exists(&self, table: TableId) -> bool {
        self.tables.lock().contains(&table)
    }

    fn tables(&self) -> Vec<TableId> {
        let mut tables: Vec<TableId> = self.tables.lock().iter().copied().collect();
        tables.sort();
        tables
    }

    fn flushed_position(&self, table: TableId) -> ReplayPosition {
        self.flushed
            .lock()
            .get(&table)
            .copied()
            .unwrap_or(ReplayPosition::NONE)
    }

    fn truncated_position(&self, table: TableId) -> Option<ReplayPosition> {
        self.truncated.lock().get(&table).copied()
    }

    fn apply(&self, mutation: TestMutation) {
        self.applied.lock().push(mutation);
    }

    fn flush(&self, table: TableId) {
        self.flush_calls.lock().push(table);
    }
}

/// Runs submitted tasks inline on the caller's thread.
pub struct DirectExecutor;

impl TaskExecutor for DirectExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

/// Holds submitted tasks without running them, so tests can observe and
/// control dispatch.
#[derive(Default)]
pub struct RecordingExecutor {
    tasks: Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl RecordingExecutor {
    /// Number of tasks submitted and not yet run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run everything submitted so far.
    pub fn run_all(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task();
        }
    }
}

impl TaskExecutor for RecordingExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        self.tasks.lock().push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_chunks_share_one_store() {
        let device = MemoryBlockDevice::new(4);
        let a = device.open_chunk("path-a").expect("chunk");
        let b = device.open_chunk("path-b").expect("chunk");

        let mut block = vec![0u8; BLOCK_SIZE];
        block[0] = 0x7E;
        a.write_block(2, 1, &block).expect("write");

        let mut seen = vec![0u8; BLOCK_SIZE];
        b.read_block(2, 1, &mut seen).expect("read");
        assert_eq!(seen[0], 0x7E);
    }

    #[test]
    fn out_of_range_transfers_are_rejected() {
        let device = MemoryBlockDevice::new(2);
        let chunk = device.open_chunk("mem0").expect("chunk");
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(chunk.read_block(2, 1, &mut buf).is_err());
    }

    #[test]
    fn mutation_round_trip() {
        let mutation = TestMutation::new(vec![
            (TableId::new(1), vec![1, 2, 3]),
            (TableId::new(2), vec![4; 40]),
            (TableId::new(1), vec![5, 6]),
        ]);
        let mut buf = vec![0u8; mutation.serialized_size()];
        mutation.serialize_into(&mut buf).expect("serialize");
        let decoded = TestMutation::deserialize(&buf).expect("deserialize");
        assert_eq!(decoded, mutation);
        assert_eq!(decoded.tables(), vec![TableId::new(1), TableId::new(2)]);
    }

    #[test]
    fn mutation_retain_filters_rows() {
        let mutation = TestMutation::new(vec![
            (TableId::new(1), vec![1]),
            (TableId::new(2), vec![2]),
        ]);
        let keep: HashSet<TableId> = [TableId::new(2)].into_iter().collect();
        let filtered = mutation.retain(&keep).expect("retain");
        assert_eq!(filtered.rows, vec![(TableId::new(2), vec![2])]);
        assert!(mutation.retain(&HashSet::new()).is_none());
    }
}
