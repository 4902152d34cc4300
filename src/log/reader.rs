//! Log Reader
//!
//! Verified reads from a log file: block images are decrypted, checked
//! against their trailer checksum and expected block number, and payload
//! reads strip the framing.

use crate::crypto::CryptoCodec;
use crate::error::{AtlasError, Result};
use crate::lsn::{BlockGeometry, Lsn, LOG_BLOCK_HDR_SIZE, LOG_BLOCK_TRL_SIZE};

use super::block;
use super::file::LogFile;

/// Why a block failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDefect {
    Checksum,
    BlockNumber { expected: u32, found: u32 },
    DataLength(usize),
    NoKey,
}

pub struct LogReader<'a> {
    file: &'a LogFile,
    geometry: BlockGeometry,
    crypto: Option<&'a CryptoCodec>,
}

impl<'a> LogReader<'a> {
    pub fn new(file: &'a LogFile, crypto: Option<&'a CryptoCodec>) -> Result<Self> {
        Ok(Self {
            file,
            geometry: BlockGeometry::new(file.block_size())?,
            crypto,
        })
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    /// Read and verify the block at block-aligned `block_lsn`.
    ///
    /// I/O errors are errors; a bad block is reported as a defect.
    pub fn read_block(&self, block_lsn: Lsn) -> Result<std::result::Result<Vec<u8>, BlockDefect>> {
        let mut image = vec![0u8; self.geometry.block_size()];
        self.file.read_at_lsn(block_lsn, &mut image)?;
        Ok(verify_block(&self.geometry, self.crypto, block_lsn, image))
    }

    /// Payload bytes in `[from, to)`, framing removed
    pub fn read_payload(&self, from: Lsn, to: Lsn) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.geometry.payload_between(from, to) as usize);
        let b = self.geometry.block_size() as u64;
        let mut block_lsn = self.geometry.align_down(from);

        while block_lsn < to {
            let lo = from.max(block_lsn + LOG_BLOCK_HDR_SIZE as u64);
            let hi = to.min(block_lsn + b - LOG_BLOCK_TRL_SIZE as u64);
            if lo < hi {
                let image = self.read_block(block_lsn)?.map_err(|defect| {
                    AtlasError::Corruption(format!("block at lsn {}: {:?}", block_lsn, defect))
                })?;
                out.extend_from_slice(&image[(lo - block_lsn) as usize..(hi - block_lsn) as usize]);
            }
            block_lsn += b;
        }
        Ok(out)
    }
}

/// Decrypt (if needed) and verify one on-disk block image
pub fn verify_block(
    geometry: &BlockGeometry,
    crypto: Option<&CryptoCodec>,
    block_lsn: Lsn,
    mut image: Vec<u8>,
) -> std::result::Result<Vec<u8>, BlockDefect> {
    if let Some(crypto) = crypto {
        crypto
            .decrypt_block(&mut image, block_lsn)
            .map_err(|_| BlockDefect::NoKey)?;
    }
    if !block::verify_checksum(&image) {
        return Err(BlockDefect::Checksum);
    }

    let expected = geometry.block_no(block_lsn);
    let found = block::hdr_no(&image);
    if expected != found {
        return Err(BlockDefect::BlockNumber { expected, found });
    }

    let len = block::data_len(&image);
    if len < LOG_BLOCK_HDR_SIZE || len > geometry.block_size() {
        return Err(BlockDefect::DataLength(len));
    }
    Ok(image)
}
