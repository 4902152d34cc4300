//! Tests for the Archive Coordinator
//!
//! These tests verify:
//! - Two clients share one group; the last stop disables it
//! - The reported files plus the trailer hold every byte from start to stop
//! - A range inside one block is reported through the trailer alone
//! - Protocol errors (stop twice, files before stop)
//! - Durable groups survive a restart, non-durable ones are discarded

use std::fs;
use std::path::Path;

use atlaslog::archive::{list_archive_files, list_group_dirs, ArchiveMeta};
use atlaslog::log::block;
use atlaslog::{
    ArchiveClient, ArchiverPhase, AtlasError, ClientState, Config, FatalPolicy, LogEngine,
    LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const B: usize = 512;

fn config(dir: &Path) -> Config {
    Config::builder()
        .log_dir(dir)
        .log_file_size(256 * 1024)
        .log_buffer_size(8 * 1024)
        .block_size(B)
        .flush_interval_ms(0)
        .archive_chunk_size(4 * 1024)
        .fatal_policy(FatalPolicy::Propagate)
        .build()
}

fn write_records(engine: &LogEngine, tag: &str, count: usize) -> Vec<u8> {
    let mut payload = Vec::new();
    for i in 0..count {
        let record = format!("{}-{:06}|", tag, i).into_bytes();
        payload.extend_from_slice(&record);
        engine.append(&record).unwrap();
    }
    payload
}

/// Rebuild the payload of a stopped client from its files and trailer
fn archived_payload(engine: &LogEngine, client: &ArchiveClient) -> Vec<u8> {
    let mut images = Vec::new();
    engine
        .archive_get_files(client, |path, size, offset| {
            if let Some(path) = path {
                let data = fs::read(path)?;
                images.extend_from_slice(&data[offset as usize..size as usize]);
            }
            Ok(())
        })
        .unwrap();
    images.extend_from_slice(client.trailer());
    assert_eq!(images.len() % B, 0);

    let mut payload = Vec::new();
    for blk in images.chunks(B) {
        assert!(block::verify_checksum(blk));
        let end = block::data_len(blk).min(B - LOG_BLOCK_TRL_SIZE);
        payload.extend_from_slice(&blk[LOG_BLOCK_HDR_SIZE..end]);
    }

    let skip = client.begin_lsn() as usize % B - LOG_BLOCK_HDR_SIZE;
    payload.split_off(skip)
}

// =============================================================================
// Client Protocol Tests
// =============================================================================

#[test]
fn test_two_clients_share_a_group() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(config(temp.path())).unwrap();

    let mut first = engine.archive_start(true).unwrap();
    write_records(&engine, "a", 50);
    let mut second = engine.archive_start(true).unwrap();
    write_records(&engine, "b", 50);

    let group = first.group().unwrap().clone();
    assert!(std::sync::Arc::ptr_eq(&group, second.group().unwrap()));
    assert!(second.begin_lsn() > first.begin_lsn());
    assert_eq!(group.ref_count(), 2);
    assert_eq!(group.active_clients(), 2);
    assert_eq!(engine.status().archive.phase, ArchiverPhase::Active);

    engine.archive_stop(&mut first).unwrap();
    assert_eq!(first.state(), ClientState::Stopped);
    assert!(group.is_active());
    assert_eq!(group.active_clients(), 1);

    write_records(&engine, "c", 10);
    engine.archive_stop(&mut second).unwrap();
    assert!(!group.is_active());
    assert!(!group.is_failed());
    assert!(group.end_lsn().is_some());
    assert_eq!(engine.status().archive.phase, ArchiverPhase::Idle);

    assert!(first.end_lsn().unwrap() < second.end_lsn().unwrap());

    engine.archive_release(first);
    assert_eq!(group.ref_count(), 1);
    engine.archive_release(second);
    assert_eq!(group.ref_count(), 0);
    assert_eq!(engine.status().archive.groups, 0);

    // Durable groups keep their files
    assert!(group.dir().exists());
}

#[test]
fn test_archive_holds_everything_between_start_and_stop() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(config(temp.path())).unwrap();
    write_records(&engine, "before", 200);

    let tail = engine.buffered_lsn();
    let mut client = engine.archive_start(true).unwrap();
    assert_eq!(client.begin_lsn(), tail);
    assert_eq!(engine.last_checkpoint().checkpoint_lsn, tail);

    let expected = write_records(&engine, "archived", 3000);
    let (end_lsn, trailer) = engine.archive_stop(&mut client).unwrap();
    assert_eq!(end_lsn, engine.buffered_lsn());
    assert_eq!(trailer.len(), B);
    assert!(engine.flushed_lsn() >= end_lsn);

    assert_eq!(archived_payload(&engine, &client), expected);

    // The header handed out at start matches the first archive file
    let files = list_archive_files(client.group().unwrap().dir()).unwrap();
    assert_eq!(files.len(), 1);
    let on_disk = fs::read(&files[0]).unwrap();
    assert_eq!(&on_disk[..client.header().len()], &client.header()[..]);
}

#[test]
fn test_archive_spans_several_files() {
    let temp = TempDir::new().unwrap();
    let config = Config::builder()
        .log_dir(temp.path())
        .log_file_size(64 * 1024)
        .log_buffer_size(4 * 1024)
        .block_size(B)
        .flush_interval_ms(0)
        .archive_chunk_size(2 * 1024)
        .fatal_policy(FatalPolicy::Propagate)
        .build();
    let engine = LogEngine::open(config).unwrap();

    let mut client = engine.archive_start(true).unwrap();
    // Roughly three times the log capacity
    let expected = write_records(&engine, "wrap", 14_000);
    engine.archive_stop(&mut client).unwrap();

    let group = client.group().unwrap();
    assert!(!group.is_failed());
    assert!(group.files().len() >= 3);

    let header = group.header_size();
    let mut offsets = Vec::new();
    engine
        .archive_get_files(&client, |path, size, offset| {
            assert!(path.unwrap().exists());
            assert!(size <= group.file_size());
            assert!(offset < size);
            offsets.push(offset);
            Ok(())
        })
        .unwrap();
    assert_eq!(offsets.len(), group.files().len());

    // Block images of every file start after its header region
    assert!(offsets[0] >= header);
    assert!(offsets[1..].iter().all(|offset| *offset == header));
    assert_eq!(archived_payload(&engine, &client), expected);
}

#[test]
fn test_range_within_one_block_uses_trailer() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(config(temp.path())).unwrap();

    let mut client = engine.archive_start(false).unwrap();
    engine.append(b"tiny").unwrap();
    engine.archive_stop(&mut client).unwrap();

    let mut calls = Vec::new();
    engine
        .archive_get_files(&client, |path, size, offset| {
            calls.push((path.map(|p| p.to_path_buf()), size, offset));
            Ok(())
        })
        .unwrap();
    assert_eq!(calls, vec![(None, 0, 0)]);
    assert_eq!(archived_payload(&engine, &client), b"tiny");
}

#[test]
fn test_protocol_errors() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(config(temp.path())).unwrap();

    let mut client = engine.archive_start(false).unwrap();
    assert!(matches!(
        engine.archive_get_files(&client, |_, _, _| Ok(())),
        Err(AtlasError::InvalidState(_))
    ));

    engine.archive_stop(&mut client).unwrap();
    assert!(matches!(
        engine.archive_stop(&mut client),
        Err(AtlasError::InvalidState(_))
    ));
}

#[test]
fn test_restart_after_idle_creates_new_group() {
    let temp = TempDir::new().unwrap();
    let engine = LogEngine::open(config(temp.path())).unwrap();

    let mut first = engine.archive_start(false).unwrap();
    write_records(&engine, "x", 10);
    engine.archive_stop(&mut first).unwrap();
    let first_dir = first.group().unwrap().dir().to_path_buf();
    engine.archive_release(first);

    // Non-durable and unreferenced: gone
    assert!(!first_dir.exists());

    let mut second = engine.archive_start(false).unwrap();
    assert_eq!(engine.status().archive.phase, ArchiverPhase::Active);
    assert_ne!(second.group().unwrap().dir(), first_dir.as_path());
    engine.archive_stop(&mut second).unwrap();
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_durable_group_survives_restart() {
    let temp = TempDir::new().unwrap();
    let archive_dir = temp.path().join("archive");

    let (begin, end) = {
        let engine = LogEngine::open(config(temp.path())).unwrap();
        let mut client = engine.archive_start(true).unwrap();
        write_records(&engine, "kept", 500);
        let (end, _) = engine.archive_stop(&mut client).unwrap();
        let begin = client.begin_lsn();
        engine.archive_release(client);
        engine.shutdown().unwrap();
        (begin, end)
    };

    let dirs = list_group_dirs(&archive_dir).unwrap();
    assert_eq!(dirs.len(), 1);
    let meta = ArchiveMeta::load(&dirs[0]).unwrap();
    assert!(meta.durable);
    assert_eq!(meta.begin_lsn, begin);
    assert_eq!(meta.block_size, B as u32);
    assert_eq!(meta.file_size, 256 * 1024);
    assert!(meta.end_lsn.unwrap() <= end);

    drop(LogEngine::open(config(temp.path())).unwrap());
    assert_eq!(list_group_dirs(&archive_dir).unwrap(), dirs);
}

#[test]
fn test_non_durable_group_discarded_on_restart() {
    let temp = TempDir::new().unwrap();
    let archive_dir = temp.path().join("archive");

    {
        let engine = LogEngine::open(config(temp.path())).unwrap();
        let client = engine.archive_start(false).unwrap();
        write_records(&engine, "lost", 100);
        // Crash with the client still attached
        std::mem::forget(client);
    }
    assert_eq!(list_group_dirs(&archive_dir).unwrap().len(), 1);

    drop(LogEngine::open(config(temp.path())).unwrap());
    assert!(list_group_dirs(&archive_dir).unwrap().is_empty());
}
