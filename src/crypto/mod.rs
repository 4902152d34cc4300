//! Crypto Codec
//!
//! Per-epoch block encryption. Every checkpoint starts a new key epoch:
//! a random seed and nonce are drawn, the seed is turned into a block key
//! through [`KeyManagement`], and the seed (not the key) is stored in the
//! checkpoint record.
//!
//! The block transform is a BLAKE3 keyed-XOF keystream XORed over the
//! block body. Header bytes stay in clear so the block number and epoch
//! tag can be read before decrypting. The trailer checksum covers the
//! plaintext, so decrypting with the wrong slot shows up as a checksum
//! mismatch.

mod keys;

pub use keys::{KeyManagement, LocalKeyManagement};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::checkpoint::CryptoEpoch;
use crate::error::{AtlasError, Result};
use crate::log::block;
use crate::lsn::Lsn;

/// Epochs kept decryptable at the same time
pub const KEY_SLOTS: usize = 4;

/// Key material of one epoch
pub struct KeySlot {
    epoch: u64,
    info: CryptoEpoch,
    key: Zeroizing<[u8; 32]>,
}

impl KeySlot {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn key_version(&self) -> u32 {
        self.info.key_version
    }

    pub fn crypto_epoch(&self) -> CryptoEpoch {
        self.info
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlot")
            .field("epoch", &self.epoch)
            .field("key_version", &self.info.key_version)
            .field("nonce", &self.info.nonce)
            .finish_non_exhaustive()
    }
}

/// XOR the keystream for one block over `body`
pub fn apply_keystream(key: &[u8; 32], nonce: u32, block_lsn: Lsn, hdr_no: u32, body: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&nonce.to_be_bytes());
    hasher.update(&block_lsn.to_be_bytes());
    hasher.update(&hdr_no.to_be_bytes());

    let mut stream = Zeroizing::new(vec![0u8; body.len()]);
    hasher.finalize_xof().fill(&mut stream);
    for (byte, k) in body.iter_mut().zip(stream.iter()) {
        *byte ^= k;
    }
}

/// Encrypts and decrypts log blocks with the slot of their epoch
pub struct CryptoCodec {
    keys: Arc<dyn KeyManagement>,
    slots: RwLock<VecDeque<KeySlot>>,
}

impl CryptoCodec {
    pub fn new(keys: Arc<dyn KeyManagement>) -> Self {
        Self {
            keys,
            slots: RwLock::new(VecDeque::with_capacity(KEY_SLOTS)),
        }
    }

    /// Install the key of a persisted epoch (idempotent)
    pub fn install(&self, epoch: u64, info: &CryptoEpoch) -> Result<()> {
        let key = Zeroizing::new(self.keys.derive_key(info.key_version, &info.seed)?);
        let mut slots = self.slots.write();
        slots.retain(|slot| slot.epoch != epoch);

        let at = slots.iter().position(|slot| slot.epoch > epoch).unwrap_or(slots.len());
        slots.insert(
            at,
            KeySlot {
                epoch,
                info: *info,
                key,
            },
        );
        while slots.len() > KEY_SLOTS {
            slots.pop_front();
        }
        Ok(())
    }

    /// Draw a fresh seed for `epoch`, install it and return what to persist
    pub fn begin_epoch(&self, epoch: u64) -> Result<CryptoEpoch> {
        let info = CryptoEpoch {
            key_version: self.keys.latest_key_version(),
            nonce: rand::random(),
            seed: rand::random(),
        };
        self.install(epoch, &info)?;
        Ok(info)
    }

    /// Epoch info of the newest slot
    pub fn current(&self) -> Option<(u64, CryptoEpoch)> {
        self.slots.read().back().map(|slot| (slot.epoch, slot.info))
    }

    pub fn epochs(&self) -> Vec<u64> {
        self.slots.read().iter().map(|slot| slot.epoch).collect()
    }

    fn with_slot<T>(&self, tag: u32, f: impl FnOnce(&KeySlot) -> T) -> Result<T> {
        let slots = self.slots.read();
        let slot = slots
            .iter()
            .rev()
            .find(|slot| slot.epoch as u32 <= tag)
            .ok_or_else(|| AtlasError::Crypto(format!("no key slot for epoch {}", tag)))?;
        Ok(f(slot))
    }

    /// Encrypt the body of `block` in place using the epoch in its header
    pub fn encrypt_block(&self, block: &mut [u8], block_lsn: Lsn) -> Result<()> {
        self.transform(block, block_lsn)
    }

    /// Decrypt the body of `block` in place; verify the checksum afterwards
    pub fn decrypt_block(&self, block: &mut [u8], block_lsn: Lsn) -> Result<()> {
        self.transform(block, block_lsn)
    }

    fn transform(&self, block: &mut [u8], block_lsn: Lsn) -> Result<()> {
        let tag = block::checkpoint_no(block);
        let hdr_no = block::hdr_no(block);
        let body = block::body_range(block.len());
        self.with_slot(tag, |slot| {
            apply_keystream(&slot.key, slot.info.nonce, block_lsn, hdr_no, &mut block[body]);
        })
    }
}
