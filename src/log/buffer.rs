//! Log Buffer
//!
//! Two fixed-size byte areas addressed by index. Appends land in the
//! active area; `promote` hands the filled part of the active area to the
//! writer and carries the last (partial) block over into the other area so
//! appending continues without waiting for the write to finish.
//!
//! The buffer is not internally locked. The engine keeps it behind one
//! mutex and pairs every `reserve` with its `append` under the same guard.

use std::ops::Range;

use tracing::debug;

use crate::error::{AtlasError, Result};
use crate::lsn::{BlockGeometry, Lsn, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE};

use super::block;

/// A contiguous range of the stream reserved for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// LSN of the first payload byte
    pub start_lsn: Lsn,
    /// LSN right after the last payload byte
    pub end_lsn: Lsn,
    offset: usize,
    len: usize,
}

impl Reservation {
    /// Payload bytes reserved
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A filled area handed to the writer
///
/// The area is owned by the writer until it is given back through
/// [`LogBuffer::recycle`].
#[derive(Debug)]
pub struct PromotedArea {
    data: Vec<u8>,
    range: Range<usize>,
    start_lsn: Lsn,
    end_lsn: Lsn,
    area_index: usize,
}

impl PromotedArea {
    /// Block-aligned LSN of the first block to write
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Buffered LSN at the moment of the promote
    pub fn end_lsn(&self) -> Lsn {
        self.end_lsn
    }

    /// Whole blocks to write
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.range.clone()]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn area_index(&self) -> usize {
        self.area_index
    }
}

/// Double-buffered in-memory log tail
pub struct LogBuffer {
    geometry: BlockGeometry,
    capacity: usize,
    areas: [Vec<u8>; 2],
    active: usize,
    /// LSN of byte 0 of the active area (block aligned)
    base_lsn: Lsn,
    /// Next LSN to hand out
    lsn: Lsn,
    /// Everything below this has been handed to the writer
    next_to_write: Lsn,
}

impl LogBuffer {
    /// Create a buffer that continues the stream at `start_lsn`.
    ///
    /// `last_block` is the on-disk image of the block containing
    /// `start_lsn`, if that block already holds data. Without it the block
    /// is initialized empty and counts as pending so the next promote
    /// writes it.
    pub fn new(
        geometry: BlockGeometry,
        capacity: usize,
        start_lsn: Lsn,
        last_block: Option<&[u8]>,
    ) -> Result<Self> {
        let b = geometry.block_size();
        if capacity < b || capacity % b != 0 {
            return Err(AtlasError::Config(format!(
                "log buffer of {} bytes is not a non-zero multiple of the block size {}",
                capacity, b
            )));
        }
        if !geometry.is_payload_position(start_lsn) {
            return Err(AtlasError::InvalidArgument(format!(
                "start lsn {} does not point at a payload byte",
                start_lsn
            )));
        }

        let base_lsn = geometry.align_down(start_lsn);
        let mut first = vec![0u8; capacity];
        let next_to_write = match last_block {
            Some(image) if image.len() == b => {
                let used = geometry.offset_in_block(start_lsn);
                first[..b].copy_from_slice(image);
                first[used..b].fill(0);
                block::set_data_len(&mut first[..b], used);
                block::set_flush_bit(&mut first[..b], false);
                start_lsn
            }
            _ => {
                block::init(&mut first[..b], &geometry, base_lsn);
                base_lsn
            }
        };

        Ok(Self {
            geometry,
            capacity,
            areas: [first, vec![0u8; capacity]],
            active: 0,
            base_lsn,
            lsn: start_lsn,
            next_to_write,
        })
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// Size of one area
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next LSN to be handed out
    pub fn buffered_lsn(&self) -> Lsn {
        self.lsn
    }

    /// LSN up to which bytes have been handed to the writer
    pub fn pending_lsn(&self) -> Lsn {
        self.next_to_write
    }

    pub fn has_pending(&self) -> bool {
        self.lsn > self.next_to_write
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    fn block_end(&self, pos: usize) -> usize {
        let b = self.geometry.block_size();
        (pos / b + 1) * b
    }

    fn fits(&self, offset: usize, framed: usize) -> bool {
        self.block_end(offset + framed) <= self.capacity
    }

    /// Reserve `size` payload bytes.
    ///
    /// Returns `Ok(None)` when the active area has no room left; the caller
    /// must promote and retry. Fails when the record could never fit.
    pub fn reserve(&mut self, size: usize) -> Result<Option<Reservation>> {
        if size == 0 {
            return Err(AtlasError::InvalidArgument(
                "cannot reserve an empty record".to_string(),
            ));
        }

        let start = self.lsn;
        let end = self.geometry.advance(start, size);
        let framed = (end - start) as usize;
        let offset = (start - self.base_lsn) as usize;

        if self.fits(offset, framed) {
            self.lsn = end;
            return Ok(Some(Reservation {
                start_lsn: start,
                end_lsn: end,
                offset,
                len: size,
            }));
        }

        // After a promote the carried block sits at the front of the area
        if !self.fits(self.geometry.offset_in_block(start), framed) {
            return Err(AtlasError::BufferTooSmall {
                requested: size,
                capacity: self.capacity,
            });
        }

        Ok(None)
    }

    /// Copy `bytes` into a reservation made under the same guard
    pub fn append(&mut self, reservation: &Reservation, bytes: &[u8]) {
        debug_assert_eq!(reservation.len, bytes.len());
        debug_assert_eq!(
            self.geometry.advance(reservation.start_lsn, bytes.len()),
            reservation.end_lsn
        );

        let geometry = self.geometry;
        let b = geometry.block_size();
        let payload_end = b - LOG_BLOCK_TRL_SIZE;
        let base_lsn = self.base_lsn;
        let area = &mut self.areas[self.active];

        let mut pos = reservation.offset;
        let first_block = pos - pos % b;
        if block::first_rec_group(&area[first_block..first_block + b]) == 0 {
            block::set_first_rec_group(&mut area[first_block..first_block + b], pos % b);
        }

        let mut src = bytes;
        while !src.is_empty() {
            let in_block = pos % b;
            let blk = pos - in_block;
            let room = payload_end - in_block;
            let n = room.min(src.len());

            area[pos..pos + n].copy_from_slice(&src[..n]);
            src = &src[n..];

            if n == room {
                block::set_data_len(&mut area[blk..blk + b], b);
                let next = blk + b;
                block::init(&mut area[next..next + b], &geometry, base_lsn + next as u64);
                pos = next + LOG_BLOCK_HDR_SIZE;
            } else {
                let used = in_block + n;
                if block::data_len(&area[blk..blk + b]) < used {
                    block::set_data_len(&mut area[blk..blk + b], used);
                }
                pos += n;
            }
        }
    }

    /// Hand every block holding unwritten bytes to the writer.
    ///
    /// Pads the unused tail of the last block with zeros, stamps
    /// `checkpoint_no` on every block, sets the flush bit on the first one,
    /// then swaps areas carrying the last block over. Returns `None` when
    /// nothing is pending.
    pub fn promote(&mut self, checkpoint_no: u64) -> Option<PromotedArea> {
        if !self.has_pending() {
            return None;
        }

        let b = self.geometry.block_size();
        let start = {
            let pos = (self.next_to_write - self.base_lsn) as usize;
            pos - pos % b
        };
        let buf_free = (self.lsn - self.base_lsn) as usize;
        let end = self.block_end(buf_free);

        let other = 1 - self.active;
        if self.areas[other].len() != self.capacity {
            debug!(area = other, "log.buffer.area_reallocated");
            self.areas[other] = vec![0u8; self.capacity];
        }

        let area = &mut self.areas[self.active];
        area[buf_free..end - LOG_BLOCK_TRL_SIZE].fill(0);
        for blk in (start..end).step_by(b) {
            block::set_checkpoint_no(&mut area[blk..blk + b], checkpoint_no);
            block::set_flush_bit(&mut area[blk..blk + b], blk == start);
        }

        let mut carry = area[end - b..end].to_vec();
        block::set_flush_bit(&mut carry, false);
        self.areas[other][..b].copy_from_slice(&carry);

        let promoted = PromotedArea {
            data: std::mem::take(&mut self.areas[self.active]),
            range: start..end,
            start_lsn: self.base_lsn + start as u64,
            end_lsn: self.lsn,
            area_index: self.active,
        };

        self.base_lsn += (end - b) as u64;
        self.active = other;
        self.next_to_write = self.lsn;

        Some(promoted)
    }

    /// Give a written area back
    pub fn recycle(&mut self, area: PromotedArea) {
        let idx = area.area_index;
        if idx != self.active && self.areas[idx].is_empty() {
            self.areas[idx] = area.data;
        }
    }

    /// Copy of the block holding the buffered LSN, tail zeroed.
    ///
    /// Returns the block's LSN with the image.
    pub fn last_block(&self) -> (Lsn, Vec<u8>) {
        let b = self.geometry.block_size();
        let buf_free = (self.lsn - self.base_lsn) as usize;
        let blk = buf_free - buf_free % b;
        let mut image = self.areas[self.active][blk..blk + b].to_vec();
        image[buf_free - blk..].fill(0);
        block::set_flush_bit(&mut image, false);
        (self.base_lsn + blk as u64, image)
    }
}
