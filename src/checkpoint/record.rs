//! Checkpoint record codec
//!
//! ```text
//! ┌──────────────────┬────────────────────┬─────────────┬───────────┐
//! │ checkpoint_no(8) │ checkpoint_lsn (8) │ end_lsn (8) │ flags (4) │
//! ├──────────────────┼────────────┬───────┴─────────────┼───────────┤
//! │ key_version (4)  │ nonce (4)  │ seed (32)           │ crc32 (4) │
//! └──────────────────┴────────────┴─────────────────────┴───────────┘
//! ```
//!
//! Even checkpoint numbers go to `CHECKPOINT_1`, odd ones to `CHECKPOINT_2`.

use crate::log::{CHECKPOINT_1, CHECKPOINT_2};
use crate::lsn::Lsn;

/// Encoded size of one slot
pub const CHECKPOINT_SLOT_LEN: usize = 72;

const FLAG_CRYPTO: u32 = 1;
const CHECKSUM_AT: usize = 68;

/// Key epoch persisted with a checkpoint (the seed, never the derived key)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoEpoch {
    pub key_version: u32,
    pub nonce: u32,
    pub seed: [u8; 32],
}

/// One checkpoint slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub checkpoint_no: u64,
    /// Recovery starts here
    pub checkpoint_lsn: Lsn,
    /// Durable end of the log when the checkpoint was written
    pub end_lsn: Lsn,
    pub crypto: Option<CryptoEpoch>,
}

impl CheckpointRecord {
    /// File offset of the slot this record belongs in
    pub fn slot_offset(&self) -> u64 {
        if self.checkpoint_no % 2 == 0 {
            CHECKPOINT_1
        } else {
            CHECKPOINT_2
        }
    }

    pub fn encode(&self) -> [u8; CHECKPOINT_SLOT_LEN] {
        let mut buf = [0u8; CHECKPOINT_SLOT_LEN];
        buf[0..8].copy_from_slice(&self.checkpoint_no.to_be_bytes());
        buf[8..16].copy_from_slice(&self.checkpoint_lsn.to_be_bytes());
        buf[16..24].copy_from_slice(&self.end_lsn.to_be_bytes());
        if let Some(epoch) = &self.crypto {
            buf[24..28].copy_from_slice(&FLAG_CRYPTO.to_be_bytes());
            buf[28..32].copy_from_slice(&epoch.key_version.to_be_bytes());
            buf[32..36].copy_from_slice(&epoch.nonce.to_be_bytes());
            buf[36..68].copy_from_slice(&epoch.seed);
        }
        let checksum = crc32fast::hash(&buf[..CHECKSUM_AT]);
        buf[CHECKSUM_AT..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Decode a slot; `None` if it is blank or fails its checksum
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < CHECKPOINT_SLOT_LEN || buf[..CHECKPOINT_SLOT_LEN].iter().all(|&b| b == 0) {
            return None;
        }

        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[at..at + 8]);
            u64::from_be_bytes(raw)
        };
        let u32_at = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        if crc32fast::hash(&buf[..CHECKSUM_AT]) != u32_at(CHECKSUM_AT) {
            return None;
        }

        let crypto = if u32_at(24) & FLAG_CRYPTO != 0 {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&buf[36..68]);
            Some(CryptoEpoch {
                key_version: u32_at(28),
                nonce: u32_at(32),
                seed,
            })
        } else {
            None
        };

        Some(Self {
            checkpoint_no: u64_at(0),
            checkpoint_lsn: u64_at(8),
            end_lsn: u64_at(16),
            crypto,
        })
    }
}
