//! Key management seam
//!
//! The log only ever persists a per-epoch seed. Turning a seed into a block
//! key is delegated to a [`KeyManagement`] implementation, so the master
//! key can live in an external service.

use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::error::{AtlasError, Result};

/// Derives block keys from persisted seeds
pub trait KeyManagement: Send + Sync {
    /// Key version new epochs should use
    fn latest_key_version(&self) -> u32;

    /// One-way derivation of the block key for `(key_version, seed)`
    fn derive_key(&self, key_version: u32, seed: &[u8; 32]) -> Result<[u8; 32]>;
}

/// In-process key management backed by BLAKE3
///
/// Version `n` is the `n`-th master key (1-based); older versions are kept
/// so historical seeds still derive.
pub struct LocalKeyManagement {
    masters: RwLock<Vec<Zeroizing<[u8; 32]>>>,
}

impl LocalKeyManagement {
    const PASSPHRASE_CONTEXT: &'static str = "atlaslog 2024-01-01 master key from passphrase";

    pub fn new(master: [u8; 32]) -> Self {
        Self {
            masters: RwLock::new(vec![Zeroizing::new(master)]),
        }
    }

    /// Random master key
    pub fn generate() -> Self {
        Self::new(rand::random())
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(blake3::derive_key(Self::PASSPHRASE_CONTEXT, passphrase.as_bytes()))
    }

    /// Add a fresh random master key and return its version
    pub fn rotate(&self) -> u32 {
        let mut masters = self.masters.write();
        masters.push(Zeroizing::new(rand::random()));
        masters.len() as u32
    }
}

impl KeyManagement for LocalKeyManagement {
    fn latest_key_version(&self) -> u32 {
        self.masters.read().len() as u32
    }

    fn derive_key(&self, key_version: u32, seed: &[u8; 32]) -> Result<[u8; 32]> {
        let masters = self.masters.read();
        let master = key_version
            .checked_sub(1)
            .and_then(|idx| masters.get(idx as usize))
            .ok_or_else(|| AtlasError::Crypto(format!("unknown key version {}", key_version)))?;

        let mut hasher = blake3::Hasher::new_keyed(master);
        hasher.update(seed);
        hasher.update(&key_version.to_be_bytes());
        Ok(*hasher.finalize().as_bytes())
    }
}
