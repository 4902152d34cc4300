//! Tests for LSN Arithmetic
//!
//! These tests verify:
//! - Block geometry validation
//! - Alignment and block numbering
//! - Advancing past headers and trailers (eager skip)
//! - Payload counting between LSNs
//! - Mapping LSNs onto the circular file body

use atlaslog::lsn::LsnMapper;
use atlaslog::{BlockGeometry, FIRST_LSN, LOG_BLOCK_HDR_SIZE};

// =============================================================================
// Helper Functions
// =============================================================================

fn geometry() -> BlockGeometry {
    BlockGeometry::new(512).unwrap()
}

fn start() -> u64 {
    FIRST_LSN + LOG_BLOCK_HDR_SIZE as u64
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_block_size_must_be_power_of_two_in_range() {
    assert!(BlockGeometry::new(256).is_err());
    assert!(BlockGeometry::new(768).is_err());
    assert!(BlockGeometry::new(8192).is_err());

    for size in [512, 1024, 2048, 4096] {
        let g = BlockGeometry::new(size).unwrap();
        assert_eq!(g.block_size(), size);
        assert_eq!(g.payload_size(), size - 16);
    }
}

#[test]
fn test_alignment() {
    let g = geometry();
    assert_eq!(g.align_down(8192), 8192);
    assert_eq!(g.align_down(8700), 8192);
    assert_eq!(g.align_up(8193), 8704);
    assert_eq!(g.align_up(8704), 8704);
    assert_eq!(g.offset_in_block(8204), 12);
}

#[test]
fn test_block_numbers_start_at_one_and_wrap() {
    let g = geometry();
    assert_eq!(g.block_no(0), 1);
    assert_eq!(g.block_no(FIRST_LSN), 17);
    assert_eq!(g.block_no(FIRST_LSN + 511), 17);
    assert_eq!(g.block_no(FIRST_LSN + 512), 18);

    // 2^30 blocks later the number repeats
    let period = (1u64 << 30) * 512;
    assert_eq!(g.block_no(FIRST_LSN + period), g.block_no(FIRST_LSN));
}

#[test]
fn test_payload_positions() {
    let g = geometry();
    assert!(!g.is_payload_position(FIRST_LSN));
    assert!(!g.is_payload_position(FIRST_LSN + 11));
    assert!(g.is_payload_position(FIRST_LSN + 12));
    assert!(g.is_payload_position(FIRST_LSN + 507));
    assert!(!g.is_payload_position(FIRST_LSN + 508));
}

// =============================================================================
// Advance Tests
// =============================================================================

#[test]
fn test_advance_within_block() {
    let g = geometry();
    assert_eq!(g.advance(start(), 0), start());
    assert_eq!(g.advance(start(), 100), start() + 100);
    assert_eq!(g.advance(start(), 495), FIRST_LSN + 507);
}

#[test]
fn test_advance_exact_fill_skips_to_next_payload() {
    let g = geometry();
    // 496 payload bytes fill the block; the next LSN is past the next header
    assert_eq!(g.advance(start(), 496), FIRST_LSN + 512 + 12);
}

#[test]
fn test_advance_across_blocks() {
    let g = geometry();
    assert_eq!(g.advance(start(), 1000), FIRST_LSN + 1024 + 20);
    assert!(g.is_payload_position(g.advance(start(), 12_345)));
}

#[test]
fn test_advance_is_monotonic() {
    let g = geometry();
    let mut lsn = start();
    for len in [1usize, 7, 300, 496, 497, 4096, 3] {
        let next = g.advance(lsn, len);
        assert!(next > lsn);
        assert!(g.is_payload_position(next));
        lsn = next;
    }
}

#[test]
fn test_payload_between_inverts_advance() {
    let g = geometry();
    for len in [0usize, 1, 495, 496, 497, 1000, 10_000] {
        let end = g.advance(start(), len);
        assert_eq!(g.payload_between(start(), end), len as u64, "len {}", len);
    }
    assert_eq!(g.payload_between(start() + 10, start()), 0);
}

// =============================================================================
// Mapper Tests
// =============================================================================

#[test]
fn test_mapper_wraps_around_the_body() {
    let mapper = LsnMapper::new(2048, 65536, FIRST_LSN).unwrap();
    let capacity = mapper.capacity();
    assert_eq!(capacity, 65536 - 2048);

    assert_eq!(mapper.calc_offset(FIRST_LSN), 2048);
    assert_eq!(mapper.calc_offset(FIRST_LSN + 512), 2048 + 512);
    assert_eq!(mapper.calc_offset(FIRST_LSN + capacity), 2048);
    assert_eq!(mapper.calc_offset(FIRST_LSN + capacity + 100), 2148);
}

#[test]
fn test_mapper_bytes_until_wrap() {
    let mapper = LsnMapper::new(2048, 65536, FIRST_LSN).unwrap();
    assert_eq!(mapper.bytes_until_wrap(FIRST_LSN), mapper.capacity());
    assert_eq!(mapper.bytes_until_wrap(FIRST_LSN + mapper.capacity() - 512), 512);
}

#[test]
fn test_mapper_rejects_headerless_file() {
    assert!(LsnMapper::new(2048, 2048, FIRST_LSN).is_err());
    assert!(LsnMapper::new(4096, 1024, FIRST_LSN).is_err());
}
