//! Log block framing
//!
//! ```text
//! ┌────────────┬──────────────┬─────────────────────┬───────────────────┬─────────┬─────────────┐
//! │ hdr_no (4) │ data_len (2) │ first_rec_group (2) │ checkpoint_no (4) │ payload │ checksum(4) │
//! └────────────┴──────────────┴─────────────────────┴───────────────────┴─────────┴─────────────┘
//! ```
//!
//! All integers are big-endian. Bit 31 of `hdr_no` is the flush bit.
//! The checksum covers the plaintext of everything before it.

use crate::lsn::{BlockGeometry, Lsn, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE};

pub const FLUSH_BIT_MASK: u32 = 0x8000_0000;

const HDR_NO: usize = 0;
const DATA_LEN: usize = 4;
const FIRST_REC_GROUP: usize = 6;
const CHECKPOINT_NO: usize = 8;

fn read_u16(block: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([block[at], block[at + 1]])
}

fn read_u32(block: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]])
}

fn write_u16(block: &mut [u8], at: usize, value: u16) {
    block[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(block: &mut [u8], at: usize, value: u32) {
    block[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Reset `block` to an empty block starting at `block_lsn`
pub fn init(block: &mut [u8], geometry: &BlockGeometry, block_lsn: Lsn) {
    block.fill(0);
    write_u32(block, HDR_NO, geometry.block_no(block_lsn));
    write_u16(block, DATA_LEN, LOG_BLOCK_HDR_SIZE as u16);
}

pub fn hdr_no(block: &[u8]) -> u32 {
    read_u32(block, HDR_NO) & !FLUSH_BIT_MASK
}

pub fn flush_bit(block: &[u8]) -> bool {
    read_u32(block, HDR_NO) & FLUSH_BIT_MASK != 0
}

pub fn set_flush_bit(block: &mut [u8], on: bool) {
    let raw = read_u32(block, HDR_NO);
    let raw = if on { raw | FLUSH_BIT_MASK } else { raw & !FLUSH_BIT_MASK };
    write_u32(block, HDR_NO, raw);
}

/// Used bytes including the header; the block size for a full block
pub fn data_len(block: &[u8]) -> usize {
    read_u16(block, DATA_LEN) as usize
}

pub fn set_data_len(block: &mut [u8], len: usize) {
    write_u16(block, DATA_LEN, len as u16);
}

pub fn first_rec_group(block: &[u8]) -> usize {
    read_u16(block, FIRST_REC_GROUP) as usize
}

pub fn set_first_rec_group(block: &mut [u8], offset: usize) {
    write_u16(block, FIRST_REC_GROUP, offset as u16);
}

pub fn checkpoint_no(block: &[u8]) -> u32 {
    read_u32(block, CHECKPOINT_NO)
}

/// Only the low 32 bits of the epoch are kept
pub fn set_checkpoint_no(block: &mut [u8], checkpoint_no: u64) {
    write_u32(block, CHECKPOINT_NO, checkpoint_no as u32);
}

pub fn calc_checksum(block: &[u8]) -> u32 {
    crc32fast::hash(&block[..block.len() - LOG_BLOCK_TRL_SIZE])
}

pub fn stored_checksum(block: &[u8]) -> u32 {
    read_u32(block, block.len() - LOG_BLOCK_TRL_SIZE)
}

pub fn store_checksum(block: &mut [u8]) {
    let checksum = calc_checksum(block);
    let at = block.len() - LOG_BLOCK_TRL_SIZE;
    write_u32(block, at, checksum);
}

pub fn verify_checksum(block: &[u8]) -> bool {
    calc_checksum(block) == stored_checksum(block)
}

/// Byte range of the body (between header and trailer)
pub fn body_range(block_size: usize) -> std::ops::Range<usize> {
    LOG_BLOCK_HDR_SIZE..block_size - LOG_BLOCK_TRL_SIZE
}
