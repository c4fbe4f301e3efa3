//! Pre-allocated append workers and the fixed-size executor that runs them.
//!
//! A worker bundles a device chunk and a reusable staging buffer. Workers are
//! created once at startup, live on a bounded pool, and are borrowed for
//! exactly one framed write at a time; the pool therefore doubles as the
//! in-flight append semaphore, and "pool is full" means no append is
//! mid-flight anywhere.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::config::{SegmentId, BLOCK_SIZE};
use crate::device::Chunk;
use crate::error::{CommitLogError, CommitLogResult};
use crate::frame;

struct PendingWrite {
    lba: u64,
    blocks: u32,
}

/// One append worker: a pinned device chunk plus an `M`-MiB staging buffer.
pub struct AppendWorker {
    chunk: Box<dyn Chunk>,
    buffer: Vec<u8>,
    pending: Option<PendingWrite>,
}

impl AppendWorker {
    pub fn new(chunk: Box<dyn Chunk>, buffer_blocks: u64) -> Self {
        Self {
            chunk,
            buffer: vec![0u8; buffer_blocks as usize * BLOCK_SIZE],
            pending: None,
        }
    }

    /// Staging buffer capacity in blocks.
    #[inline]
    pub fn buffer_blocks(&self) -> u64 {
        (self.buffer.len() / BLOCK_SIZE) as u64
    }

    /// Frame the payload into the staging buffer and arm the worker to write
    /// it at the given device address.
    pub fn stage(
        &mut self,
        segment_id: SegmentId,
        payload: &[u8],
        lba: u64,
    ) -> CommitLogResult<u32> {
        self.stage_with(segment_id, payload.len(), lba, |dst| {
            dst.copy_from_slice(payload);
            Ok(())
        })
    }

    /// Like [`AppendWorker::stage`], with the payload serialized by `write`
    /// directly into the staging buffer.
    pub fn stage_with<F>(
        &mut self,
        segment_id: SegmentId,
        payload_len: usize,
        lba: u64,
        write: F,
    ) -> CommitLogResult<u32>
    where
        F: FnOnce(&mut [u8]) -> CommitLogResult<()>,
    {
        let blocks = frame::encode_with(segment_id, payload_len, &mut self.buffer, write)?;
        self.pending = Some(PendingWrite { lba, blocks });
        Ok(blocks)
    }

    /// Perform the staged write.
    pub fn perform(&mut self) -> CommitLogResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| CommitLogError::InvalidState("worker has no staged write".to_string()))?;
        self.chunk
            .write_block(pending.lba, pending.blocks as u64, &self.buffer)
    }

    pub fn close(&self) -> CommitLogResult<()> {
        self.chunk.close()
    }
}

/// Bounded pool of idle workers with an all-idle monitor.
pub struct WorkerPool {
    capacity: usize,
    idle: Mutex<Vec<AppendWorker>>,
    worker_returned: Condvar,
    pool_full: Condvar,
}

impl WorkerPool {
    pub fn new(workers: Vec<AppendWorker>) -> Self {
        Self {
            capacity: workers.len(),
            idle: Mutex::new(workers),
            worker_returned: Condvar::new(),
            pool_full: Condvar::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of workers currently idle.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Borrow a worker, blocking while none is idle.
    pub fn take(&self) -> AppendWorker {
        let mut idle = self.idle.lock();
        loop {
            if let Some(worker) = idle.pop() {
                return worker;
            }
            self.worker_returned.wait(&mut idle);
        }
    }

    /// Return a worker. Wakes one borrower, and wakes every all-idle waiter
    /// when this return refills the pool.
    pub fn put(&self, worker: AppendWorker) {
        let mut idle = self.idle.lock();
        idle.push(worker);
        self.worker_returned.notify_one();
        if idle.len() == self.capacity {
            self.pool_full.notify_all();
        }
    }

    /// Block until every worker is idle. Segment bookkeeping reads are only
    /// consistent while nothing is mid-append.
    pub fn wait_all_idle(&self) {
        let mut idle = self.idle.lock();
        while idle.len() < self.capacity {
            self.pool_full.wait(&mut idle);
        }
    }

    /// Wait for every worker to come home, then remove them all for closing.
    pub fn drain(&self) -> Vec<AppendWorker> {
        let mut idle = self.idle.lock();
        while idle.len() < self.capacity {
            self.pool_full.wait(&mut idle);
        }
        std::mem::take(&mut *idle)
    }
}

enum AppendCommand {
    Write {
        worker: AppendWorker,
        reply: Sender<(AppendWorker, CommitLogResult<()>)>,
    },
    Shutdown,
}

/// Fixed-size executor draining staged writes onto device threads.
pub struct AppendExecutor {
    command_tx: Sender<AppendCommand>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AppendExecutor {
    pub fn new(threads: usize) -> CommitLogResult<Self> {
        let (tx, rx) = unbounded::<AppendCommand>();
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let rx: Receiver<AppendCommand> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("flashlog-append-{index}"))
                .spawn(move || Self::worker_loop(rx))?;
            handles.push(handle);
        }
        Ok(Self {
            command_tx: tx,
            handles: Mutex::new(handles),
        })
    }

    fn worker_loop(rx: Receiver<AppendCommand>) {
        while let Ok(command) = rx.recv() {
            match command {
                AppendCommand::Write { mut worker, reply } => {
                    let result = worker.perform();
                    if let Err(err) = &result {
                        error!(error = %err, "append worker failed to persist record");
                    }
                    let _ = reply.send((worker, result));
                }
                AppendCommand::Shutdown => break,
            }
        }
    }

    /// Submit a staged worker and block until its write completes. The
    /// worker always comes back to the caller, along with the write result.
    pub fn submit(
        &self,
        worker: AppendWorker,
    ) -> CommitLogResult<(AppendWorker, CommitLogResult<()>)> {
        let (reply_tx, reply_rx) = bounded(1);
        self.command_tx
            .send(AppendCommand::Write {
                worker,
                reply: reply_tx,
            })
            .map_err(|_| CommitLogError::ExecutorStopped)?;
        reply_rx.recv().map_err(|_| CommitLogError::ExecutorStopped)
    }

    /// Stop every executor thread and join them.
    pub fn shutdown(&self) {
        let handles = {
            let mut handles = self.handles.lock();
            if handles.is_empty() {
                return;
            }
            for _ in 0..handles.len() {
                let _ = self.command_tx.send(AppendCommand::Shutdown);
            }
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for AppendExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
