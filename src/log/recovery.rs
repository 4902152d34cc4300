//! Log Recovery
//!
//! Finds where an existing log ends.
//!
//! ## Recovery Process
//! 1. Decode both checkpoint slots, keep the valid one with the highest number
//! 2. Re-install the crypto epochs recorded in the slots
//! 3. Scan blocks forward from the checkpoint until the first partial or
//!    invalid block (bad checksum, wrong block number)
//! 4. The end of the log must not fall before the checkpoint's end LSN

use tracing::{debug, info};

use crate::checkpoint::CheckpointRecord;
use crate::crypto::CryptoCodec;
use crate::error::{AtlasError, Result};
use crate::lsn::{Lsn, LOG_BLOCK_HDR_SIZE};

use super::block;
use super::file::LogFile;
use super::reader::LogReader;

/// Result of scanning an existing log
#[derive(Debug, Clone)]
pub struct RecoveryResult {
    /// Checkpoint recovery started from
    pub checkpoint: CheckpointRecord,
    /// The other slot, if valid
    pub previous: Option<CheckpointRecord>,
    /// First LSN after the last durable payload byte
    pub end_lsn: Lsn,
    pub blocks_scanned: u64,
    /// Plaintext image of the block holding `end_lsn`, if it holds data
    pub last_block: Option<Vec<u8>>,
}

/// Checkpoint selection and end-of-log scan
pub struct LogRecovery;

impl LogRecovery {
    /// Latest valid checkpoint and, if valid, the one before it
    pub fn read_checkpoints(file: &LogFile) -> Result<(CheckpointRecord, Option<CheckpointRecord>)> {
        let slots = file.read_checkpoint_slots()?;
        let mut records: Vec<CheckpointRecord> = slots
            .iter()
            .filter_map(|raw| CheckpointRecord::decode(raw))
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.checkpoint_no));

        let mut records = records.into_iter();
        let latest = records.next().ok_or_else(|| {
            AtlasError::Corruption(format!(
                "no valid checkpoint in {}",
                file.path().display()
            ))
        })?;
        Ok((latest, records.next()))
    }

    /// Install the key epochs of the given checkpoints
    pub fn install_epochs(crypto: &CryptoCodec, records: &[CheckpointRecord]) -> Result<()> {
        for record in records {
            match &record.crypto {
                Some(epoch) => crypto.install(record.checkpoint_no, epoch)?,
                None => {
                    return Err(AtlasError::Crypto(format!(
                        "checkpoint {} carries no key epoch",
                        record.checkpoint_no
                    )))
                }
            }
        }
        Ok(())
    }

    /// Full recovery of `file`
    pub fn recover(file: &LogFile, crypto: Option<&CryptoCodec>) -> Result<RecoveryResult> {
        let (latest, previous) = Self::read_checkpoints(file)?;

        if let Some(crypto) = crypto {
            let mut records: Vec<CheckpointRecord> = previous.into_iter().collect();
            records.push(latest);
            Self::install_epochs(crypto, &records)?;
        }

        let result = Self::scan(file, crypto, latest, previous)?;
        info!(
            checkpoint_no = result.checkpoint.checkpoint_no,
            checkpoint_lsn = result.checkpoint.checkpoint_lsn,
            end_lsn = result.end_lsn,
            blocks = result.blocks_scanned,
            "log.recovery.complete"
        );
        Ok(result)
    }

    /// Scan forward from `checkpoint` to the end of the log
    pub fn scan(
        file: &LogFile,
        crypto: Option<&CryptoCodec>,
        checkpoint: CheckpointRecord,
        previous: Option<CheckpointRecord>,
    ) -> Result<RecoveryResult> {
        let reader = LogReader::new(file, crypto)?;
        let geometry = *reader.geometry();
        let b = geometry.block_size() as u64;

        let mut block_lsn = geometry.align_down(checkpoint.checkpoint_lsn);
        let limit = block_lsn + file.capacity();
        let mut scanned = 0u64;

        let (end_lsn, last_block) = loop {
            if block_lsn >= limit {
                break (block_lsn + LOG_BLOCK_HDR_SIZE as u64, None);
            }
            match reader.read_block(block_lsn)? {
                Ok(image) => {
                    scanned += 1;
                    let len = block::data_len(&image);
                    if len == geometry.block_size() {
                        block_lsn += b;
                        continue;
                    }
                    break (block_lsn + len as u64, Some(image));
                }
                Err(defect) => {
                    debug!(block_lsn, ?defect, "log.recovery.end_of_log");
                    break (block_lsn + LOG_BLOCK_HDR_SIZE as u64, None);
                }
            }
        };

        if end_lsn < checkpoint.end_lsn {
            return Err(AtlasError::Corruption(format!(
                "log ends at lsn {} before checkpoint {} end lsn {}",
                end_lsn, checkpoint.checkpoint_no, checkpoint.end_lsn
            )));
        }

        Ok(RecoveryResult {
            checkpoint,
            previous,
            end_lsn,
            blocks_scanned: scanned,
            last_block,
        })
    }
}
