//! Back-pressure, concurrency, and lifecycle behavior of the append path.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use flashlog::test_support::{
    DirectExecutor, MemoryBlockDevice, RecordingExecutor, TestHost, TestMutation,
};
use flashlog::{CommitLog, CommitLogConfig, CommitLogError, ReplayPosition, TableId};

const TABLE: TableId = TableId(7);

fn small_config() -> CommitLogConfig {
    CommitLogConfig {
        devices: vec!["mem0".to_string()],
        start_offset: 0,
        max_segments: 8,
        blocks_per_segment: 4,
        threads: 2,
        buffer_mib: 1,
        emergency_valve: 0.25,
    }
}

/// A single-row mutation whose framed record fills a whole test segment.
fn segment_filling_mutation(marker: u8) -> TestMutation {
    let mut mutation = TestMutation::single(TABLE, 3 * 4096 + 64);
    mutation.rows[0].1[0] = marker;
    mutation
}

#[test]
fn emergency_valve_enqueues_flush_requests_when_slots_run_low() {
    let config = small_config();
    let host = Arc::new(TestHost::with_tables(&[TABLE]));
    let device = MemoryBlockDevice::for_config(&config);
    let maintenance = Arc::new(RecordingExecutor::default());
    let log = CommitLog::open(
        config.clone(),
        &device,
        Arc::clone(&host),
        Arc::new(DirectExecutor),
        Arc::clone(&maintenance) as Arc<dyn flashlog::TaskExecutor>,
    )
    .expect("open log");

    // Each append fills one segment; seven rollovers leave one free slot,
    // dropping the free list below 8 * 0.25 = 2 and firing the valve.
    for i in 0..8 {
        log.add(&segment_filling_mutation(i as u8))
            .expect("add")
            .expect("position");
    }

    assert!(maintenance.pending() >= 1, "valve should enqueue flush work");
    assert!(log.metrics().emergency_flush_requests >= 1);
    // The flush work runs on the host's executor, never inline.
    assert!(host.flush_calls().is_empty());
    maintenance.run_all();
    assert!(host.flush_calls().contains(&TABLE));
}

#[test]
fn concurrent_appends_are_each_durable_exactly_once() {
    let config = CommitLogConfig {
        max_segments: 8,
        blocks_per_segment: 64,
        threads: 4,
        ..small_config()
    };
    let host = Arc::new(TestHost::with_tables(&[TABLE]));
    let device = MemoryBlockDevice::for_config(&config);

    const WRITERS: u8 = 4;
    const PER_WRITER: u8 = 8;
    {
        let log = Arc::new(
            CommitLog::open(
                config.clone(),
                &device,
                Arc::clone(&host),
                Arc::new(DirectExecutor),
                Arc::new(DirectExecutor),
            )
            .expect("open log"),
        );

        let handles: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for seq in 0..PER_WRITER {
                        let mut mutation = TestMutation::single(TABLE, 64);
                        mutation.rows[0].1[0] = writer;
                        mutation.rows[0].1[1] = seq;
                        let position = log
                            .add(&mutation)
                            .expect("add")
                            .expect("not oversize");
                        assert!(position > ReplayPosition::NONE);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        assert_eq!(log.pending_appends(), 0);
        assert_eq!(log.metrics().appends, (WRITERS as u64) * (PER_WRITER as u64));
    }

    let log = CommitLog::open(
        config,
        &device,
        Arc::clone(&host),
        Arc::new(DirectExecutor),
        Arc::new(DirectExecutor),
    )
    .expect("reopen log");
    let replayed = log.recover().expect("recover");
    assert_eq!(replayed, (WRITERS as u64) * (PER_WRITER as u64));

    let seen: HashSet<(u8, u8)> = host
        .applied()
        .iter()
        .map(|mutation| (mutation.rows[0].1[0], mutation.rows[0].1[1]))
        .collect();
    assert_eq!(seen.len(), WRITERS as usize * PER_WRITER as usize);
}

#[test]
fn get_context_reflects_the_last_append() {
    let config = small_config();
    let host = Arc::new(TestHost::with_tables(&[TABLE]));
    let device = MemoryBlockDevice::for_config(&config);
    let log = CommitLog::open(
        config,
        &device,
        Arc::clone(&host),
        Arc::new(DirectExecutor),
        Arc::new(DirectExecutor),
    )
    .expect("open log");

    assert_eq!(log.get_context(), ReplayPosition::NONE);
    log.add(&TestMutation::single(TABLE, 100)).expect("add");
    let second = log
        .add(&TestMutation::single(TABLE, 100))
        .expect("add")
        .expect("position");
    assert_eq!(log.get_context(), second);
}

#[test]
fn force_recycle_drops_segments_pinned_by_dropped_tables() {
    let config = small_config();
    let dropped = TableId(9);
    let host = Arc::new(TestHost::with_tables(&[TABLE, dropped]));
    let device = MemoryBlockDevice::for_config(&config);
    let log = CommitLog::open(
        config.clone(),
        &device,
        Arc::clone(&host),
        Arc::new(DirectExecutor),
        Arc::new(DirectExecutor),
    )
    .expect("open log");

    // Fill two segments with data for the soon-to-be-dropped table.
    for i in 0..2 {
        let mut mutation = TestMutation::new(vec![(dropped, vec![0u8; 3 * 4096 + 48])]);
        mutation.rows[0].1[0] = i as u8;
        log.add(&mutation).expect("add").expect("position");
    }
    assert_eq!(device.bookkeeping_ids(&config)[0], 1);

    host.drop_table(dropped);
    log.force_recycle_all_segments(&[dropped]).expect("force recycle");

    // The filled segment recycles; the active one stays.
    let ids = device.bookkeeping_ids(&config);
    assert_eq!(ids[0], 0);
    assert_eq!(ids[1], 2);
}

#[test]
fn shutdown_refuses_further_appends() {
    let config = small_config();
    let host = Arc::new(TestHost::with_tables(&[TABLE]));
    let device = MemoryBlockDevice::for_config(&config);
    let log = CommitLog::open(
        config,
        &device,
        Arc::clone(&host),
        Arc::new(DirectExecutor),
        Arc::new(DirectExecutor),
    )
    .expect("open log");

    log.add(&TestMutation::single(TABLE, 100)).expect("add");
    log.shutdown().expect("shutdown");
    log.shutdown().expect("shutdown is idempotent");

    assert!(matches!(
        log.add(&TestMutation::single(TABLE, 100)),
        Err(CommitLogError::Shutdown)
    ));
}
