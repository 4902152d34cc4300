//! LSN Arithmetic
//!
//! Pure functions mapping log sequence numbers onto blocks and onto byte
//! offsets inside the circular body of a log file.
//!
//! An LSN counts every byte of the framed stream, block headers and
//! trailers included, so `lsn % block_size` is the position inside the
//! block. LSNs handed to callers always point at a payload byte: when a
//! block fills exactly, the next LSN is the first payload byte of the
//! following block.
//!
//! ```text
//!  block k                                   block k+1
//! ┌──────────┬───────────────────┬─────────┬──────────┬──────
//! │ hdr (12) │ payload (B - 16)  │ crc (4) │ hdr (12) │ ...
//! └──────────┴───────────────────┴─────────┴──────────┴──────
//! ^ k*B      ^ k*B + 12          ^ (k+1)*B - 4
//! ```

use crate::error::{AtlasError, Result};

/// Logical position in the redo stream
pub type Lsn = u64;

/// LSN of the first block of a freshly created log
pub const FIRST_LSN: Lsn = 8192;

pub const LOG_BLOCK_HDR_SIZE: usize = 12;
pub const LOG_BLOCK_TRL_SIZE: usize = 4;
pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Block numbers wrap at 2^30
const BLOCK_NO_MASK: u64 = 0x3FFF_FFFF;

/// Block framing for a fixed block size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    block_size: u64,
}

impl BlockGeometry {
    pub fn new(block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(AtlasError::Config(format!(
                "block size {} must be a power of two in {}..={}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        Ok(Self {
            block_size: block_size as u64,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Payload bytes carried by one block
    pub fn payload_size(&self) -> usize {
        self.block_size() - LOG_BLOCK_HDR_SIZE - LOG_BLOCK_TRL_SIZE
    }

    pub fn align_down(&self, lsn: Lsn) -> Lsn {
        lsn & !(self.block_size - 1)
    }

    pub fn align_up(&self, lsn: Lsn) -> Lsn {
        self.align_down(lsn + self.block_size - 1)
    }

    pub fn offset_in_block(&self, lsn: Lsn) -> usize {
        (lsn & (self.block_size - 1)) as usize
    }

    /// Header block number of the block containing `lsn`
    pub fn block_no(&self, lsn: Lsn) -> u32 {
        (((lsn / self.block_size) & BLOCK_NO_MASK) + 1) as u32
    }

    /// True if `lsn` points at a payload byte (never at framing)
    pub fn is_payload_position(&self, lsn: Lsn) -> bool {
        let off = self.offset_in_block(lsn);
        off >= LOG_BLOCK_HDR_SIZE && off < self.block_size() - LOG_BLOCK_TRL_SIZE
    }

    /// LSN reached after appending `len` payload bytes at `lsn`.
    ///
    /// Skips trailers and headers; a block filled exactly moves the result
    /// to the first payload byte of the next block.
    pub fn advance(&self, lsn: Lsn, len: usize) -> Lsn {
        let payload_end = self.block_size() - LOG_BLOCK_TRL_SIZE;
        let mut lsn = lsn;
        let mut left = len;
        loop {
            let room = payload_end - self.offset_in_block(lsn);
            if left < room {
                return lsn + left as u64;
            }
            left -= room;
            lsn = self.align_down(lsn) + self.block_size + LOG_BLOCK_HDR_SIZE as u64;
        }
    }

    /// Number of payload bytes in `[from, to)`
    pub fn payload_between(&self, from: Lsn, to: Lsn) -> u64 {
        if to <= from {
            return 0;
        }
        let first_block = self.align_down(from);
        let last_block = self.align_down(to);
        if first_block == last_block {
            return to - from;
        }
        let payload_end = (self.block_size() - LOG_BLOCK_TRL_SIZE) as u64;
        let head = payload_end - self.offset_in_block(from) as u64;
        let middle = (last_block - first_block) / self.block_size - 1;
        let tail = self.offset_in_block(to) as u64 - LOG_BLOCK_HDR_SIZE as u64;
        head + middle * self.payload_size() as u64 + tail
    }
}

/// Maps LSNs onto the circular body of one log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsnMapper {
    header_size: u64,
    capacity: u64,
    first_lsn: Lsn,
}

impl LsnMapper {
    /// `first_lsn` is the block-aligned LSN stored at body offset 0
    pub fn new(header_size: u64, file_size: u64, first_lsn: Lsn) -> Result<Self> {
        if file_size <= header_size {
            return Err(AtlasError::Config(format!(
                "file size {} leaves no room after a {} byte header",
                file_size, header_size
            )));
        }
        Ok(Self {
            header_size,
            capacity: file_size - header_size,
            first_lsn,
        })
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    /// Size of the circular body
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    /// Physical file offset of `lsn`
    pub fn calc_offset(&self, lsn: Lsn) -> u64 {
        debug_assert!(lsn >= self.first_lsn);
        self.header_size + (lsn - self.first_lsn) % self.capacity
    }

    /// Bytes from `lsn` to the physical end of the body
    pub fn bytes_until_wrap(&self, lsn: Lsn) -> u64 {
        self.header_size + self.capacity - self.calc_offset(lsn)
    }
}
