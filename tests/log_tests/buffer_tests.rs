//! Tests for the Log Buffer
//!
//! These tests verify:
//! - Reservation LSNs follow the block framing
//! - Records too large for the buffer are rejected
//! - A full active area asks for a promote
//! - Promote pads, stamps and carries the partial block over
//! - The image of the last block

use atlaslog::log::{block, LogBuffer};
use atlaslog::{AtlasError, BlockGeometry, FIRST_LSN, LOG_BLOCK_HDR_SIZE};

// =============================================================================
// Helper Functions
// =============================================================================

const B: usize = 512;

fn start() -> u64 {
    FIRST_LSN + LOG_BLOCK_HDR_SIZE as u64
}

fn new_buffer(blocks: usize) -> LogBuffer {
    let geometry = BlockGeometry::new(B).unwrap();
    LogBuffer::new(geometry, blocks * B, start(), None).unwrap()
}

fn append(buffer: &mut LogBuffer, record: &[u8]) -> u64 {
    let reservation = buffer.reserve(record.len()).unwrap().unwrap();
    buffer.append(&reservation, record);
    reservation.end_lsn
}

// =============================================================================
// Construction Tests
// =============================================================================

#[test]
fn test_capacity_must_be_block_multiple() {
    let geometry = BlockGeometry::new(B).unwrap();
    assert!(LogBuffer::new(geometry, 0, start(), None).is_err());
    assert!(LogBuffer::new(geometry, B + 100, start(), None).is_err());
    assert!(LogBuffer::new(geometry, 2 * B, start(), None).is_ok());
}

#[test]
fn test_start_lsn_must_be_payload_position() {
    let geometry = BlockGeometry::new(B).unwrap();
    assert!(LogBuffer::new(geometry, 2 * B, FIRST_LSN, None).is_err());
}

#[test]
fn test_fresh_buffer_has_pending_first_block() {
    let buffer = new_buffer(2);
    assert_eq!(buffer.buffered_lsn(), start());
    assert_eq!(buffer.pending_lsn(), FIRST_LSN);
    assert!(buffer.has_pending());
}

// =============================================================================
// Reservation Tests
// =============================================================================

#[test]
fn test_reservations_are_contiguous() {
    let mut buffer = new_buffer(4);
    let geometry = *buffer.geometry();

    let a = buffer.reserve(100).unwrap().unwrap();
    buffer.append(&a, &[1u8; 100]);
    let b = buffer.reserve(600).unwrap().unwrap();
    buffer.append(&b, &[2u8; 600]);

    assert_eq!(a.start_lsn, start());
    assert_eq!(a.end_lsn, start() + 100);
    assert_eq!(b.start_lsn, a.end_lsn);
    assert_eq!(b.end_lsn, geometry.advance(a.end_lsn, 600));
    assert_eq!(buffer.buffered_lsn(), b.end_lsn);
}

#[test]
fn test_empty_record_rejected() {
    let mut buffer = new_buffer(2);
    assert!(matches!(buffer.reserve(0), Err(AtlasError::InvalidArgument(_))));
}

#[test]
fn test_record_larger_than_buffer_rejected() {
    let mut buffer = new_buffer(2);
    let err = buffer.reserve(2000).unwrap_err();
    assert!(matches!(err, AtlasError::BufferTooSmall { requested: 2000, capacity: 1024 }));
}

#[test]
fn test_full_area_asks_for_promote() {
    let mut buffer = new_buffer(2);
    append(&mut buffer, &[1u8; 400]);
    append(&mut buffer, &[2u8; 400]);

    // Fits after a promote, not in what is left of this area
    assert!(buffer.reserve(400).unwrap().is_none());

    let area = buffer.promote(0).unwrap();
    buffer.recycle(area);
    assert!(buffer.reserve(400).unwrap().is_some());
}

// =============================================================================
// Framing Tests
// =============================================================================

#[test]
fn test_append_frames_blocks() {
    let mut buffer = new_buffer(4);
    append(&mut buffer, &[1u8; 400]);
    append(&mut buffer, &[2u8; 400]);
    append(&mut buffer, &[3u8; 50]);

    let area = buffer.promote(3).unwrap();
    let bytes = area.bytes();
    assert_eq!(area.start_lsn(), FIRST_LSN);
    assert_eq!(area.len(), 2 * B);

    let first = &bytes[..B];
    assert_eq!(block::hdr_no(first), 17);
    assert_eq!(block::data_len(first), B);
    assert_eq!(block::first_rec_group(first), 12);
    assert_eq!(block::checkpoint_no(first), 3);
    assert!(block::flush_bit(first));

    // The second record spills 304 bytes into block 2; the third starts after
    let second = &bytes[B..2 * B];
    assert_eq!(block::hdr_no(second), 18);
    assert_eq!(block::first_rec_group(second), 12 + 304);
    assert_eq!(block::data_len(second), 12 + 304 + 50);
    assert!(!block::flush_bit(second));

    // Payload bytes in order, framing in between
    assert_eq!(&first[12..412], &[1u8; 400][..]);
    assert_eq!(&first[412..508], &[2u8; 96][..]);
    assert_eq!(&second[12..316], &[2u8; 304][..]);
    assert_eq!(&second[316..366], &[3u8; 50][..]);
    assert!(second[366..B - 4].iter().all(|b| *b == 0));
}

#[test]
fn test_promote_nothing_pending() {
    let mut buffer = new_buffer(2);
    let area = buffer.promote(0).unwrap();
    assert_eq!(area.end_lsn(), start());
    buffer.recycle(area);

    assert!(!buffer.has_pending());
    assert!(buffer.promote(0).is_none());
}

#[test]
fn test_partial_block_is_rewritten_by_next_promote() {
    let mut buffer = new_buffer(2);
    append(&mut buffer, &[9u8; 100]);
    let first = buffer.promote(0).unwrap();
    assert_eq!(first.start_lsn(), FIRST_LSN);
    buffer.recycle(first);

    let end = append(&mut buffer, &[8u8; 100]);
    let second = buffer.promote(0).unwrap();
    assert_eq!(second.start_lsn(), FIRST_LSN);
    assert_eq!(second.end_lsn(), end);

    let blk = &second.bytes()[..B];
    assert_eq!(block::data_len(blk), 12 + 200);
    assert_eq!(&blk[12..112], &[9u8; 100][..]);
    assert_eq!(&blk[112..212], &[8u8; 100][..]);
}

#[test]
fn test_last_block_image() {
    let mut buffer = new_buffer(2);
    append(&mut buffer, &[5u8; 600]);

    let (block_lsn, image) = buffer.last_block();
    assert_eq!(block_lsn, FIRST_LSN + B as u64);
    assert_eq!(image.len(), B);
    assert_eq!(block::hdr_no(&image), 18);
    assert_eq!(block::data_len(&image), 12 + 104);
    assert!(image[12 + 104..].iter().all(|b| *b == 0));
}

#[test]
fn test_resume_from_on_disk_block() {
    let geometry = BlockGeometry::new(B).unwrap();
    let mut original = LogBuffer::new(geometry, 2 * B, start(), None).unwrap();
    let end = append(&mut original, &[4u8; 100]);
    let (_, image) = original.last_block();

    let mut resumed = LogBuffer::new(geometry, 2 * B, end, Some(&image)).unwrap();
    assert_eq!(resumed.buffered_lsn(), end);
    assert!(!resumed.has_pending());

    append(&mut resumed, &[6u8; 10]);
    let area = resumed.promote(0).unwrap();
    let blk = &area.bytes()[..B];
    assert_eq!(&blk[12..112], &[4u8; 100][..]);
    assert_eq!(&blk[112..122], &[6u8; 10][..]);
}
