//! Local encryption of record payloads.
//!
//! - PBKDF2-HMAC-SHA1 for passcode → 256-byte key material
//! - AES-256-IGE with a per-message key/IV derived from the integrity tag
//! - SHA1 over the padded plaintext as the 16-byte integrity tag
//!
//! Encrypted layout:
//!
//! ```text
//! [tag: 16][IGE( u32 LE length | plaintext | random pad to 16 )]
//! ```
//!
//! The length prefix counts itself, so a valid value is always at least 4
//! and lies within the last 16-byte block of the decrypted buffer.
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `LocalKey` clears its material when dropped and
//!   never prints it through `Debug`
//! - **Integrity**: the tag covers the length prefix, the plaintext and the
//!   padding, so any bit flip in the tag or ciphertext is rejected

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use md5::Md5;
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::stream::StreamWriter;

/// Error types for crypto operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid encrypted length: {0}")]
    InvalidLength(usize),
    #[error("Wrong key or corrupt data")]
    TagMismatch,
    #[error("Corrupt length prefix {declared} for {padded} decrypted bytes")]
    CorruptLength { declared: u32, padded: usize },
}

/// Size of local key material
pub const LOCAL_KEY_SIZE: usize = 256;
/// Size of a KDF salt
pub const SALT_SIZE: usize = 32;
/// Size of the integrity tag prepended to ciphertext
pub const TAG_SIZE: usize = 16;

const BLOCK_SIZE: usize = 16;
const LENGTH_PREFIX_SIZE: usize = 4;
/// Offset into the key material used by the local (receive-direction) schedule
const LOCAL_KEY_OFFSET: usize = 8;

/// 256-byte key material used for local encryption
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LocalKey([u8; LOCAL_KEY_SIZE]);

impl LocalKey {
    /// Wrap raw key material
    #[must_use]
    pub fn from_bytes(bytes: [u8; LOCAL_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap raw key material from a slice of exactly `LOCAL_KEY_SIZE` bytes
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; LOCAL_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Fresh random key material
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; LOCAL_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive key material with PBKDF2-HMAC-SHA1
    #[must_use]
    pub fn derive(passcode: &[u8], salt: &[u8], iterations: u32) -> Self {
        let mut bytes = [0u8; LOCAL_KEY_SIZE];
        pbkdf2_hmac::<Sha1>(passcode, salt, iterations.max(1), &mut bytes);
        Self(bytes)
    }

    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; LOCAL_KEY_SIZE] {
        &self.0
    }
}

impl Clone for LocalKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl PartialEq for LocalKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for LocalKey {}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalKey([REDACTED])")
    }
}

/// Random KDF salt
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Compare two byte strings without early exit
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// MD5 over the concatenation of `parts`
#[must_use]
pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derive the AES key and IV for one message from its integrity tag
fn prepare_aes(
    key: &LocalKey,
    msg_key: &[u8; TAG_SIZE],
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let k = key.as_bytes();
    let x = LOCAL_KEY_OFFSET;

    let a = Zeroizing::new(sha1(&[msg_key.as_slice(), &k[x..x + 32]]));
    let b = Zeroizing::new(sha1(&[&k[32 + x..48 + x], msg_key.as_slice(), &k[48 + x..64 + x]]));
    let c = Zeroizing::new(sha1(&[&k[64 + x..96 + x], msg_key.as_slice()]));
    let d = Zeroizing::new(sha1(&[msg_key.as_slice(), &k[96 + x..128 + x]]));

    let mut aes_key = Zeroizing::new([0u8; 32]);
    aes_key[..8].copy_from_slice(&a[..8]);
    aes_key[8..20].copy_from_slice(&b[8..20]);
    aes_key[20..32].copy_from_slice(&c[4..16]);

    let mut aes_iv = Zeroizing::new([0u8; 32]);
    aes_iv[..12].copy_from_slice(&a[8..20]);
    aes_iv[12..20].copy_from_slice(&b[..8]);
    aes_iv[20..24].copy_from_slice(&c[16..20]);
    aes_iv[24..32].copy_from_slice(&d[..8]);

    (aes_key, aes_iv)
}

/// AES-256-IGE encryption in place
/// iv[0..16] seeds the previous ciphertext block, iv[16..32] the previous plaintext block
fn aes_ige_encrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_cipher = [0u8; BLOCK_SIZE];
    let mut prev_plain = [0u8; BLOCK_SIZE];
    prev_cipher.copy_from_slice(&iv[..BLOCK_SIZE]);
    prev_plain.copy_from_slice(&iv[BLOCK_SIZE..]);

    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let mut plain = [0u8; BLOCK_SIZE];
        plain.copy_from_slice(chunk);

        let mut block = [0u8; BLOCK_SIZE];
        for j in 0..BLOCK_SIZE {
            block[j] = plain[j] ^ prev_cipher[j];
        }
        let mut ga = GenericArray::from(block);
        cipher.encrypt_block(&mut ga);
        for j in 0..BLOCK_SIZE {
            chunk[j] = ga[j] ^ prev_plain[j];
        }

        prev_plain = plain;
        prev_cipher.copy_from_slice(chunk);
    }
    prev_plain.zeroize();
}

/// AES-256-IGE decryption in place
fn aes_ige_decrypt(data: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let mut prev_cipher = [0u8; BLOCK_SIZE];
    let mut prev_plain = [0u8; BLOCK_SIZE];
    prev_cipher.copy_from_slice(&iv[..BLOCK_SIZE]);
    prev_plain.copy_from_slice(&iv[BLOCK_SIZE..]);

    for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
        let mut encrypted = [0u8; BLOCK_SIZE];
        encrypted.copy_from_slice(chunk);

        let mut block = [0u8; BLOCK_SIZE];
        for j in 0..BLOCK_SIZE {
            block[j] = encrypted[j] ^ prev_plain[j];
        }
        let mut ga = GenericArray::from(block);
        cipher.decrypt_block(&mut ga);
        for j in 0..BLOCK_SIZE {
            chunk[j] = ga[j] ^ prev_cipher[j];
        }

        prev_cipher = encrypted;
        prev_plain.copy_from_slice(chunk);
    }
    prev_plain.zeroize();
}

/// Encrypt a plaintext record stream under `key`
#[must_use]
pub fn encrypt_local(plaintext: &[u8], key: &LocalKey) -> Vec<u8> {
    let full_len = LENGTH_PREFIX_SIZE + plaintext.len();
    let padded_len = full_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

    let mut data = Zeroizing::new(vec![0u8; padded_len]);
    data[..LENGTH_PREFIX_SIZE].copy_from_slice(&(full_len as u32).to_le_bytes());
    data[LENGTH_PREFIX_SIZE..full_len].copy_from_slice(plaintext);
    OsRng.fill_bytes(&mut data[full_len..]);

    let digest = sha1(&[data.as_slice()]);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&digest[..TAG_SIZE]);

    let (aes_key, aes_iv) = prepare_aes(key, &tag);
    aes_ige_encrypt(&mut data, &aes_key, &aes_iv);

    let mut out = Vec::with_capacity(TAG_SIZE + padded_len);
    out.extend_from_slice(&tag);
    out.extend_from_slice(data.as_slice());
    out
}

/// Decrypt and verify a payload produced by `encrypt_local`
pub fn decrypt_local(encrypted: &[u8], key: &LocalKey) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() <= TAG_SIZE || (encrypted.len() - TAG_SIZE) % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(encrypted.len()));
    }
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&encrypted[..TAG_SIZE]);

    let mut data = Zeroizing::new(encrypted[TAG_SIZE..].to_vec());
    let (aes_key, aes_iv) = prepare_aes(key, &tag);
    aes_ige_decrypt(&mut data, &aes_key, &aes_iv);

    let digest = sha1(&[data.as_slice()]);
    if !constant_time_eq(&digest[..TAG_SIZE], &tag) {
        return Err(CryptoError::TagMismatch);
    }

    let padded = data.len();
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&data[..LENGTH_PREFIX_SIZE]);
    let declared = u32::from_le_bytes(prefix);
    let len = declared as usize;
    if len > padded || len <= padded - BLOCK_SIZE || len < LENGTH_PREFIX_SIZE {
        return Err(CryptoError::CorruptLength { declared, padded });
    }

    Ok(data[LENGTH_PREFIX_SIZE..len].to_vec())
}

/// XOR an auxiliary secret into the first 8 bytes of a tag
pub fn bind_auxiliary_secret(tag: &mut [u8; TAG_SIZE], secret: u64) {
    for (byte, mask) in tag[..8].iter_mut().zip(secret.to_le_bytes()) {
        *byte ^= mask;
    }
}

/// Remove an auxiliary secret previously bound into a tag
pub fn unbind_auxiliary_secret(tag: &mut [u8; TAG_SIZE], secret: u64) {
    bind_auxiliary_secret(tag, secret);
}

/// Encrypt and bind the result to an out-of-band secret
#[must_use]
pub fn encrypt_bound(plaintext: &[u8], key: &LocalKey, secret: u64) -> Vec<u8> {
    let mut out = encrypt_local(plaintext, key);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&out[..TAG_SIZE]);
    bind_auxiliary_secret(&mut tag, secret);
    out[..TAG_SIZE].copy_from_slice(&tag);
    out
}

/// Decrypt a payload produced by `encrypt_bound` with the same secret
pub fn decrypt_bound(encrypted: &[u8], key: &LocalKey, secret: u64) -> Result<Vec<u8>, CryptoError> {
    if encrypted.len() <= TAG_SIZE {
        return Err(CryptoError::InvalidLength(encrypted.len()));
    }
    let mut unbound = encrypted.to_vec();
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&unbound[..TAG_SIZE]);
    unbind_auxiliary_secret(&mut tag, secret);
    unbound[..TAG_SIZE].copy_from_slice(&tag);
    decrypt_local(&unbound, key)
}

/// Staging buffer for a plaintext record stream awaiting encryption
#[derive(Debug, Default)]
pub struct EncryptedDescriptor {
    pub stream: StreamWriter,
}

impl EncryptedDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { stream: StreamWriter::with_capacity(capacity) }
    }

    /// Encrypt the accumulated records under `key`
    #[must_use]
    pub fn encrypt(&self, key: &LocalKey) -> Vec<u8> {
        encrypt_local(self.stream.as_bytes(), key)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> LocalKey {
        let mut bytes = [0u8; LOCAL_KEY_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        LocalKey::from_bytes(bytes)
    }

    #[test]
    fn test_pbkdf2_sha1_rfc6070_vectors() {
        // PBKDF2 output blocks are independent, so the first 20 bytes match dkLen = 20
        let one = LocalKey::derive(b"password", b"salt", 1);
        assert_eq!(
            hex::encode(&one.as_bytes()[..20]),
            "0c60c80f961f0e71f3a9b524af6012062fe037a6"
        );
        let two = LocalKey::derive(b"password", b"salt", 2);
        assert_eq!(
            hex::encode(&two.as_bytes()[..20]),
            "ea6c014dc72d6f8ccd1ed92ace1d41f0d8de8957"
        );
    }

    #[test]
    fn test_derive_depends_on_salt_and_passcode() {
        let base = LocalKey::derive(b"pass", &[1u8; SALT_SIZE], 4);
        assert_eq!(base, LocalKey::derive(b"pass", &[1u8; SALT_SIZE], 4));
        assert_ne!(base, LocalKey::derive(b"pass", &[2u8; SALT_SIZE], 4));
        assert_ne!(base, LocalKey::derive(b"other", &[1u8; SALT_SIZE], 4));
        assert_ne!(base, LocalKey::derive(b"pass", &[1u8; SALT_SIZE], 5));
    }

    #[test]
    fn test_md5_vector() {
        assert_eq!(hex::encode(md5(&[])), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5(&[b"ab".as_slice(), b"c".as_slice()]), md5(&[b"abc".as_slice()]));
    }

    #[test]
    fn test_round_trip_various_lengths() {
        let key = test_key(7);
        for len in [0usize, 1, 11, 12, 13, 16, 28, 100, 1000] {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let encrypted = encrypt_local(&plaintext, &key);

            let expected_len = TAG_SIZE + (4 + len).div_ceil(16) * 16;
            assert_eq!(encrypted.len(), expected_len, "length for {}", len);
            assert_eq!(decrypt_local(&encrypted, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_random_padding_changes_output() {
        let key = test_key(1);
        let a = encrypt_local(b"abc", &key);
        let b = encrypt_local(b"abc", &key);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let encrypted = encrypt_local(b"secret data", &test_key(1));
        assert_eq!(
            decrypt_local(&encrypted, &test_key(2)),
            Err(CryptoError::TagMismatch)
        );
    }

    #[test]
    fn test_tamper_tag_length_and_last_block() {
        let key = test_key(3);
        let plaintext = vec![0x5Au8; 70];
        let encrypted = encrypt_local(&plaintext, &key);

        // Flip in tag, in the block holding the length prefix, and in the last block
        for index in [0, TAG_SIZE, TAG_SIZE + 1, encrypted.len() - 1] {
            let mut tampered = encrypted.clone();
            tampered[index] ^= 0x01;
            assert!(decrypt_local(&tampered, &key).is_err(), "flip at {}", index);
        }
    }

    #[test]
    fn test_invalid_lengths() {
        let key = test_key(0);
        assert_eq!(decrypt_local(&[0u8; 16], &key), Err(CryptoError::InvalidLength(16)));
        assert_eq!(decrypt_local(&[0u8; 33], &key), Err(CryptoError::InvalidLength(33)));
        assert_eq!(decrypt_local(&[], &key), Err(CryptoError::InvalidLength(0)));
    }

    #[test]
    fn test_corrupt_length_prefix_with_valid_tag() {
        // Build a buffer whose tag is correct but whose prefix points outside the last block
        let key = test_key(9);
        let mut data = vec![0u8; 32];
        data[..4].copy_from_slice(&4u32.to_le_bytes());
        let digest = sha1(&[data.as_slice()]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&digest[..TAG_SIZE]);
        let (k, iv) = prepare_aes(&key, &tag);
        aes_ige_encrypt(&mut data, &k, &iv);

        let mut blob = tag.to_vec();
        blob.extend_from_slice(&data);
        assert_eq!(
            decrypt_local(&blob, &key),
            Err(CryptoError::CorruptLength { declared: 4, padded: 32 })
        );
    }

    #[test]
    fn test_ige_round_trip_and_chaining() {
        let key = [0x11u8; 32];
        let iv = [0x22u8; 32];
        let original: Vec<u8> = (0..64).collect();

        let mut data = original.clone();
        aes_ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, original);

        // A change in the first ciphertext block garbles every following block
        let mut corrupted = data.clone();
        corrupted[0] ^= 0xFF;
        aes_ige_decrypt(&mut corrupted, &key, &iv);
        for block in 0..4 {
            let range = block * 16..(block + 1) * 16;
            assert_ne!(corrupted[range.clone()], original[range]);
        }

        aes_ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, original);
    }

    #[test]
    fn test_bound_round_trip_requires_secret() {
        let key = test_key(5);
        let encrypted = encrypt_bound(b"score:100", &key, 0xDEAD_BEEF_0000_0001);

        assert_eq!(
            decrypt_bound(&encrypted, &key, 0xDEAD_BEEF_0000_0001).unwrap(),
            b"score:100"
        );
        assert!(decrypt_bound(&encrypted, &key, 0xDEAD_BEEF_0000_0002).is_err());
        assert!(decrypt_local(&encrypted, &key).is_err());
    }

    #[test]
    fn test_bind_is_self_inverse() {
        let mut tag = [0xABu8; TAG_SIZE];
        bind_auxiliary_secret(&mut tag, 0x0102_0304_0506_0708);
        assert_ne!(tag, [0xABu8; TAG_SIZE]);
        assert_eq!(tag[8..], [0xABu8; 8]);
        unbind_auxiliary_secret(&mut tag, 0x0102_0304_0506_0708);
        assert_eq!(tag, [0xABu8; TAG_SIZE]);
    }

    #[test]
    fn test_encrypted_descriptor() {
        let key = test_key(4);
        let mut data = EncryptedDescriptor::new();
        data.stream.write_u64(42);
        data.stream.write_string("hello");

        let plaintext = decrypt_local(&data.encrypt(&key), &key).unwrap();
        assert_eq!(plaintext, data.stream.as_bytes());
    }

    #[test]
    fn test_local_key_debug_redacted() {
        let key = test_key(0xAA);
        let printed = format!("{:?}", key);
        assert_eq!(printed, "LocalKey([REDACTED])");
    }

    #[test]
    fn test_local_key_from_slice() {
        assert!(LocalKey::from_slice(&[0u8; 255]).is_none());
        let key = LocalKey::from_slice(&[3u8; LOCAL_KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes()[0], 3);
    }
}
