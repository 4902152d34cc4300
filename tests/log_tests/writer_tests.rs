//! Tests for the Writer
//!
//! These tests verify:
//! - Group commit: one promote and one physical write for a batch
//! - Idempotent write_up_to
//! - Non-durable writes leave the flush watermark alone
//! - flushed <= write <= buffered under concurrent appenders
//! - A failed leader write reaches every waiting committer
//! - Waiting committers unwind on shutdown

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use atlaslog::{
    AtlasError, Collaborators, Config, FatalPolicy, IoInterceptor, LogEngine, Lsn, Severity,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn small_config(dir: &TempDir, buffer_blocks: usize) -> Config {
    Config::builder()
        .log_dir(dir.path())
        .log_file_size(256 * 1024)
        .log_buffer_size(buffer_blocks * 512)
        .block_size(512)
        .flush_interval_ms(0)
        .fatal_policy(FatalPolicy::Propagate)
        .build()
}

#[derive(Default)]
struct FailingDisk {
    fail: AtomicBool,
    writes: AtomicUsize,
}

impl IoInterceptor for FailingDisk {
    fn before_write(&self, _lsn: Lsn, _len: usize) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        Ok(())
    }
}

// =============================================================================
// Group Commit Tests
// =============================================================================

#[test]
fn test_one_block_buffer_single_write() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(&temp, 1)).unwrap();
    let before = engine.stats();

    // Three records of a third of a block each
    let record = [0xABu8; 160];
    engine.append(&record).unwrap();
    engine.append(&record).unwrap();
    let lsn = engine.append(&record).unwrap();
    engine.commit(lsn).unwrap();

    let after = engine.stats();
    assert_eq!(after.promotes - before.promotes, 1);
    assert_eq!(after.physical_writes - before.physical_writes, 1);
    assert!(engine.flushed_lsn() >= lsn);
}

#[test]
fn test_write_up_to_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(&temp, 4)).unwrap();

    let lsn = engine.append(b"committed once").unwrap();
    engine.commit(lsn).unwrap();
    let first = engine.stats();

    engine.commit(lsn).unwrap();
    engine.write_up_to(lsn, false).unwrap();
    assert_eq!(engine.stats(), first);
}

#[test]
fn test_non_durable_write() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(&temp, 4)).unwrap();

    let lsn = engine.append(&[1u8; 300]).unwrap();
    engine.write_up_to(lsn, false).unwrap();

    let watermarks = engine.watermarks();
    assert!(watermarks.write() >= lsn);
    assert!(watermarks.flushed() < lsn);

    engine.commit(lsn).unwrap();
    assert!(engine.watermarks().flushed() >= lsn);
}

#[test]
fn test_commit_beyond_buffered_is_clamped() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(&temp, 4)).unwrap();

    let lsn = engine.append(b"tail").unwrap();
    engine.commit(lsn + 1_000_000).unwrap();
    assert_eq!(engine.flushed_lsn(), lsn);
}

#[test]
fn test_commits_batch_across_threads() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(LogEngine::open(small_config(&temp, 8)).unwrap());
    let before = engine.stats();

    let handles: Vec<_> = (0..8)
        .map(|id| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..50 {
                    let lsn = engine.append(&[id as u8; 64]).unwrap();
                    engine.commit(lsn).unwrap();
                    assert!(engine.flushed_lsn() >= lsn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let after = engine.stats();
    assert!(after.flushes - before.flushes <= 400);
    assert_eq!(engine.flushed_lsn(), engine.buffered_lsn());
}

// =============================================================================
// Watermark Tests
// =============================================================================

#[test]
fn test_watermark_order_holds_under_load() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(LogEngine::open(small_config(&temp, 4)).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut samples = 0u64;
            while !done.load(Ordering::SeqCst) {
                let status = engine.status();
                assert!(status.flushed_lsn <= status.write_lsn);
                assert!(status.write_lsn <= status.buffered_lsn);
                samples += 1;
            }
            samples
        })
    };

    let writers: Vec<_> = (0..4)
        .map(|id| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..200 {
                    let lsn = engine.append(&[id as u8; 100]).unwrap();
                    if i % 3 == 0 {
                        engine.commit(lsn).unwrap();
                    } else if i % 3 == 1 {
                        engine.write_up_to(lsn, false).unwrap();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(observer.join().unwrap() > 0);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_failed_write_reaches_every_committer() {
    let temp = TempDir::new().unwrap();
    let disk = Arc::new(FailingDisk::default());
    let collaborators = Collaborators {
        io_interceptor: Some(disk.clone()),
        ..Collaborators::default()
    };
    let engine = Arc::new(LogEngine::open_with(small_config(&temp, 8), collaborators).unwrap());

    let lsn = engine.append(b"before the failure").unwrap();
    engine.commit(lsn).unwrap();

    disk.fail.store(true, Ordering::SeqCst);
    let barrier = Arc::new(Barrier::new(6));
    let handles: Vec<_> = (0..6)
        .map(|id| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> atlaslog::Result<()> {
                let lsn = engine.append(&[id as u8; 32])?;
                barrier.wait();
                engine.commit(lsn)
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.join().unwrap();
        let err = outcome.expect_err("no committer may believe its record is durable");
        assert!(err.is_fatal(), "unexpected error: {}", err);
    }

    // The failure is latched
    assert!(engine.writer_failure().is_some());
    let lsn = engine.append(b"after the failure").unwrap();
    assert!(matches!(engine.commit(lsn), Err(AtlasError::Fatal(_))));

    let status = engine.status();
    assert!(status.events.iter().any(|e| e.severity == Severity::Fatal));
    assert!(status.flushed_lsn < status.buffered_lsn);
}

#[test]
fn test_failed_flush_is_fatal() {
    struct FailingFlush;
    impl IoInterceptor for FailingFlush {
        fn before_flush(&self) -> io::Result<()> {
            Err(io::Error::other("injected flush failure"))
        }
    }

    let temp = TempDir::new().unwrap();
    let collaborators = Collaborators {
        io_interceptor: Some(Arc::new(FailingFlush)),
        ..Collaborators::default()
    };
    // The initial sync on open already fails
    let err = LogEngine::open_with(small_config(&temp, 4), collaborators).err().unwrap();
    assert!(err.is_fatal());
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[derive(Default)]
struct StalledDisk {
    hold: AtomicBool,
    entered: AtomicBool,
}

impl IoInterceptor for StalledDisk {
    fn before_write(&self, _lsn: Lsn, _len: usize) -> io::Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            while self.hold.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

#[test]
fn test_waiting_committer_unwinds_on_shutdown() {
    let temp = TempDir::new().unwrap();
    let disk = Arc::new(StalledDisk::default());
    let collaborators = Collaborators {
        io_interceptor: Some(disk.clone()),
        ..Collaborators::default()
    };
    let engine = Arc::new(LogEngine::open_with(small_config(&temp, 8), collaborators).unwrap());

    disk.hold.store(true, Ordering::SeqCst);
    let leader = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let lsn = engine.append(b"leader").unwrap();
            engine.commit(lsn)
        })
    };
    while !disk.entered.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }

    let follower = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let lsn = engine.append(b"follower").unwrap();
            engine.commit(lsn)
        })
    };
    thread::sleep(Duration::from_millis(50));
    engine.request_shutdown();

    let err = follower.join().unwrap().unwrap_err();
    assert!(matches!(err, AtlasError::Interrupted(_)), "got {}", err);

    // The stalled leader still finishes its write
    disk.hold.store(false, Ordering::SeqCst);
    leader.join().unwrap().unwrap();
    assert!(engine.writer_failure().is_none());
}
