//! Checksums and artifact encryption.
//!
//! Artifacts are sealed with AES-256-GCM; the 12-byte nonce is prepended to
//! the ciphertext so an artifact is self-contained. Integrity is tracked as
//! hex-encoded SHA-256 over the final on-disk bytes.

use crate::error::{EngineError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use zeroize::ZeroizeOnDrop;

pub const NONCE_SIZE: usize = 12;

/// 256-bit artifact encryption key, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey {
    key: [u8; 32],
}

impl EncryptionKey {
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Parse a hex-encoded 256-bit key (64 hex characters).
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| EngineError::Crypto(format!("invalid key encoding: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::Crypto("encryption key must be 32 bytes".into()))?;
        Ok(Self { key })
    }

    /// Generate a fresh random key from the OS entropy source.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encrypt plaintext, returning `nonce || ciphertext+tag`.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = key
        .cipher()
        .encrypt(nonce, plaintext)
        .map_err(|_| EngineError::Crypto("encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext+tag`. Fails on truncation, a wrong key, or
/// any bit flip in the payload (GCM tag check).
pub fn open(key: &EncryptionKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + 16 {
        return Err(EngineError::Crypto("sealed payload too short".into()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    key.cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|_| EngineError::Crypto("decryption failed: bad key or corrupted data".into()))
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex-encoded SHA-256 of a file, streamed in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let plaintext = b"regulated payload";

        let sealed = seal(&key, plaintext).unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], plaintext.as_slice());
        assert!(sealed.len() >= NONCE_SIZE + plaintext.len() + 16);

        let opened = open(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_open_detects_tampering() {
        let key = EncryptionKey::generate();
        let mut sealed = seal(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let sealed = seal(&EncryptionKey::generate(), b"payload").unwrap();
        assert!(open(&EncryptionKey::generate(), &sealed).is_err());
    }

    #[test]
    fn test_key_from_hex() {
        let key = EncryptionKey::generate();
        let hex_key = hex::encode(key.key);
        assert!(EncryptionKey::from_hex(&hex_key).is_ok());
        assert!(EncryptionKey::from_hex("deadbeef").is_err());
        assert!(EncryptionKey::from_hex("not hex").is_err());
    }

    #[test]
    fn test_sha256_matches_between_slice_and_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"checksum me").unwrap();
        assert_eq!(sha256_hex(b"checksum me"), sha256_file(&path).unwrap());
    }
}
