//! Tests for block encryption
//!
//! These tests verify:
//! - Encrypting a block keeps the header in clear and round-trips
//! - The wrong key shows up as a checksum mismatch
//! - Blocks pick the newest epoch at or below their tag
//! - Only the newest KEY_SLOTS epochs are kept
//! - An encrypted log reopens and reads back with the same keys

use std::fs;
use std::path::Path;
use std::sync::Arc;

use atlaslog::crypto::{CryptoCodec, KEY_SLOTS};
use atlaslog::log::{block, verify_block, BlockDefect, LOG_FILE_NAME};
use atlaslog::{
    AtlasError, BlockGeometry, Collaborators, Config, FatalPolicy, KeyManagement, LocalKeyManagement,
    LogEngine, FIRST_LSN,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const B: usize = 512;

fn geometry() -> BlockGeometry {
    BlockGeometry::new(B).unwrap()
}

/// A sealed plaintext block tagged with `epoch`
fn plain_block(block_lsn: u64, epoch: u64) -> Vec<u8> {
    let mut blk = vec![0u8; B];
    block::init(&mut blk, &geometry(), block_lsn);
    for (i, byte) in blk[12..300].iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    block::set_data_len(&mut blk, 300);
    block::set_checkpoint_no(&mut blk, epoch);
    block::store_checksum(&mut blk);
    blk
}

fn codec(master: u8) -> CryptoCodec {
    CryptoCodec::new(Arc::new(LocalKeyManagement::new([master; 32])))
}

fn encrypted_config(dir: &Path) -> Config {
    Config::builder()
        .log_dir(dir)
        .log_file_size(128 * 1024)
        .log_buffer_size(4 * 1024)
        .block_size(B)
        .encryption(true)
        .flush_interval_ms(0)
        .fatal_policy(FatalPolicy::Propagate)
        .build()
}

fn with_keys(keys: &Arc<LocalKeyManagement>) -> Collaborators {
    Collaborators {
        key_management: Some(keys.clone()),
        ..Collaborators::default()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// =============================================================================
// Codec Tests
// =============================================================================

#[test]
fn test_block_round_trip_keeps_header_clear() {
    let codec = codec(1);
    codec.begin_epoch(0).unwrap();

    let plain = plain_block(FIRST_LSN, 0);
    let mut blk = plain.clone();
    codec.encrypt_block(&mut blk, FIRST_LSN).unwrap();

    assert_eq!(&blk[..12], &plain[..12]);
    assert_eq!(&blk[B - 4..], &plain[B - 4..]);
    assert_ne!(&blk[12..B - 4], &plain[12..B - 4]);
    assert!(!block::verify_checksum(&blk));

    codec.decrypt_block(&mut blk, FIRST_LSN).unwrap();
    assert_eq!(blk, plain);
}

#[test]
fn test_keystream_depends_on_block_position() {
    let key = [5u8; 32];
    let mut a = vec![0u8; 64];
    let mut b = vec![0u8; 64];
    atlaslog::crypto::apply_keystream(&key, 7, FIRST_LSN, 17, &mut a);
    atlaslog::crypto::apply_keystream(&key, 7, FIRST_LSN + B as u64, 18, &mut b);
    assert_ne!(a, b);

    // XOR is its own inverse
    atlaslog::crypto::apply_keystream(&key, 7, FIRST_LSN, 17, &mut a);
    assert!(a.iter().all(|byte| *byte == 0));
}

#[test]
fn test_wrong_key_is_checksum_mismatch() {
    let writer = codec(1);
    let info = writer.begin_epoch(0).unwrap();
    let mut blk = plain_block(FIRST_LSN, 0);
    writer.encrypt_block(&mut blk, FIRST_LSN).unwrap();

    // Same seed, different master key
    let reader = codec(2);
    reader.install(0, &info).unwrap();
    assert_eq!(
        verify_block(&geometry(), Some(&reader), FIRST_LSN, blk.clone()),
        Err(BlockDefect::Checksum)
    );

    let same = codec(1);
    same.install(0, &info).unwrap();
    let image = verify_block(&geometry(), Some(&same), FIRST_LSN, blk).unwrap();
    assert_eq!(image, plain_block(FIRST_LSN, 0));
}

#[test]
fn test_block_uses_newest_epoch_at_or_below_tag() {
    let codec = codec(3);
    let second = codec.begin_epoch(2).unwrap();
    codec.begin_epoch(5).unwrap();

    // Tag 4 was written under epoch 2
    let plain = plain_block(FIRST_LSN, 4);
    let mut blk = plain.clone();
    codec.encrypt_block(&mut blk, FIRST_LSN).unwrap();

    let only_two = self::codec(3);
    only_two.install(2, &second).unwrap();
    only_two.decrypt_block(&mut blk, FIRST_LSN).unwrap();
    assert_eq!(blk, plain);

    // Nothing at or below tag 1
    let mut early = plain_block(FIRST_LSN, 1);
    assert!(matches!(
        codec.encrypt_block(&mut early, FIRST_LSN),
        Err(AtlasError::Crypto(_))
    ));
}

#[test]
fn test_slot_retention() {
    let codec = codec(4);
    for epoch in 0..7 {
        codec.begin_epoch(epoch).unwrap();
    }
    assert_eq!(codec.epochs(), vec![3, 4, 5, 6]);
    assert_eq!(codec.epochs().len(), KEY_SLOTS);
    assert_eq!(codec.current().unwrap().0, 6);

    // Reinstalling an epoch replaces it instead of adding a slot
    let (_, info) = codec.current().unwrap();
    codec.install(6, &info).unwrap();
    assert_eq!(codec.epochs(), vec![3, 4, 5, 6]);
}

#[test]
fn test_unknown_key_version_rejected() {
    let keys = LocalKeyManagement::generate();
    assert_eq!(keys.latest_key_version(), 1);
    assert!(keys.derive_key(1, &[0u8; 32]).is_ok());
    assert!(matches!(keys.derive_key(2, &[0u8; 32]), Err(AtlasError::Crypto(_))));
    assert!(matches!(keys.derive_key(0, &[0u8; 32]), Err(AtlasError::Crypto(_))));

    assert_eq!(keys.rotate(), 2);
    assert_ne!(
        keys.derive_key(1, &[0u8; 32]).unwrap(),
        keys.derive_key(2, &[0u8; 32]).unwrap()
    );
}

#[test]
fn test_passphrase_keys_are_stable() {
    let a = LocalKeyManagement::from_passphrase("correct horse");
    let b = LocalKeyManagement::from_passphrase("correct horse");
    let c = LocalKeyManagement::from_passphrase("battery staple");
    let seed = [8u8; 32];
    assert_eq!(a.derive_key(1, &seed).unwrap(), b.derive_key(1, &seed).unwrap());
    assert_ne!(a.derive_key(1, &seed).unwrap(), c.derive_key(1, &seed).unwrap());
}

// =============================================================================
// Engine Tests
// =============================================================================

#[test]
fn test_encryption_needs_key_management() {
    let temp = TempDir::new().unwrap();
    let err = LogEngine::open(encrypted_config(temp.path())).err().unwrap();
    assert!(matches!(err, AtlasError::Config(_)), "got {}", err);
}

#[test]
fn test_encrypted_log_reopens() {
    let temp = TempDir::new().unwrap();
    let keys = Arc::new(LocalKeyManagement::from_passphrase("atlas"));
    let secret = b"attack at dawn, bring snacks".to_vec();

    let (from, end) = {
        let engine = LogEngine::open_with(encrypted_config(temp.path()), with_keys(&keys)).unwrap();
        let from = engine.buffered_lsn();
        let mut end = from;
        for _ in 0..40 {
            end = engine.append(&secret).unwrap();
        }
        engine.commit(end).unwrap();
        assert_eq!(engine.read_payload(from, from + secret.len() as u64).unwrap(), secret);
        (from, end)
    };

    let raw = fs::read(temp.path().join(LOG_FILE_NAME)).unwrap();
    assert!(!contains(&raw, &secret));

    let engine = LogEngine::open_with(encrypted_config(temp.path()), with_keys(&keys)).unwrap();
    assert_eq!(engine.buffered_lsn(), end);
    let payload = engine.read_payload(from, end).unwrap();
    assert_eq!(payload.len(), 40 * secret.len());
    assert!(payload.chunks(secret.len()).all(|chunk| chunk == &secret[..]));
}

#[test]
fn test_checkpoints_rotate_epochs() {
    let temp = TempDir::new().unwrap();
    let keys = Arc::new(LocalKeyManagement::generate());

    let (from, expected, end) = {
        let engine = LogEngine::open_with(encrypted_config(temp.path()), with_keys(&keys)).unwrap();
        assert_eq!(engine.key_epochs(), vec![0]);

        for i in 0..6u8 {
            engine.append(&[i; 100]).unwrap();
            assert!(engine.make_checkpoint().unwrap());
            if i == 2 {
                keys.rotate();
            }
        }
        let epochs = engine.key_epochs();
        assert_eq!(epochs.len(), KEY_SLOTS);
        assert_eq!(*epochs.last().unwrap(), 6);

        let from = engine.last_checkpoint().checkpoint_lsn;
        let expected = b"written under the newest key".to_vec();
        let end = engine.append(&expected).unwrap();
        engine.commit(end).unwrap();
        (from, expected, end)
    };

    let engine = LogEngine::open_with(encrypted_config(temp.path()), with_keys(&keys)).unwrap();
    assert_eq!(engine.key_epochs(), vec![5, 6]);
    assert_eq!(engine.buffered_lsn(), end);
    assert_eq!(engine.read_payload(from, end).unwrap(), expected);
}

#[test]
fn test_encryption_setting_must_match_file() {
    let temp = TempDir::new().unwrap();
    let keys = Arc::new(LocalKeyManagement::generate());
    drop(LogEngine::open_with(encrypted_config(temp.path()), with_keys(&keys)).unwrap());

    let plain = Config {
        encryption: false,
        ..encrypted_config(temp.path())
    };
    let err = LogEngine::open(plain).err().unwrap();
    assert!(matches!(err, AtlasError::Config(_)), "got {}", err);
}
