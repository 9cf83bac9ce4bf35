//! Crypto collaborator: sealed backup blobs and content digests.
//!
//! Blobs are sealed with XChaCha20-Poly1305 as `nonce(24) || ciphertext`.
//! The key lives in a single key file that is generated on first use.

use crate::error::{GuardError, Result};
use crate::hasher::FileHasher;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::fs;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Operations the integrity core needs from the crypto layer.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>>;
    fn hash_file(&self, path: &Path) -> Result<String>;
    fn hash_bytes(&self, data: &[u8]) -> String;
}

pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(key.as_mut());
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(GuardError::Crypto(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Load the key file, or create it (mode 0600 on unix) when absent.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                info!(path = %path.display(), "encryption key loaded");
                Self::from_bytes(&bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| GuardError::io(parent, e))?;
                }
                fs::write(path, key.0.as_ref()).map_err(|e| GuardError::io(path, e))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                        .map_err(|e| GuardError::io(path, e))?;
                }
                info!(path = %path.display(), "encryption key generated");
                Ok(key)
            }
            Err(e) => Err(GuardError::io(path, e)),
        }
    }
}

pub fn encrypt(key: &[u8], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| GuardError::Crypto(format!("encrypt: {e}")))
}

pub fn decrypt(key: &[u8], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = XNonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| GuardError::Crypto(format!("decrypt: {e}")))
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Default [`CryptoProvider`]: sealed blobs under one symmetric key plus a
/// streaming [`FileHasher`].
pub struct VaultCrypto {
    key: EncryptionKey,
    hasher: FileHasher,
}

impl VaultCrypto {
    pub fn new(key: EncryptionKey, hasher: FileHasher) -> Self {
        Self { key, hasher }
    }
}

impl CryptoProvider for VaultCrypto {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = generate_nonce();
        let ciphertext = encrypt(self.key.0.as_ref(), &nonce, plaintext)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(GuardError::Crypto(format!(
                "sealed blob too short ({} bytes)",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);
        decrypt(self.key.0.as_ref(), &nonce_arr, ciphertext)
    }

    fn hash_file(&self, path: &Path) -> Result<String> {
        self.hasher.hash_file(path)
    }

    fn hash_bytes(&self, data: &[u8]) -> String {
        self.hasher.hash_bytes(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sealed_blob_opens_with_same_key_only() {
        let crypto = VaultCrypto::new(EncryptionKey::generate(), FileHasher::default());
        let sealed = crypto.encrypt(b"critical data").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"critical data");
        assert_eq!(crypto.decrypt(&sealed).unwrap(), b"critical data");

        let other = VaultCrypto::new(EncryptionKey::generate(), FileHasher::default());
        assert!(matches!(other.decrypt(&sealed), Err(GuardError::Crypto(_))));
        assert!(matches!(crypto.decrypt(b"short"), Err(GuardError::Crypto(_))));
    }

    #[test]
    fn key_file_is_reused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("secret.key");
        let first = EncryptionKey::load_or_generate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEY_LEN);
        let second = EncryptionKey::load_or_generate(&path).unwrap();

        let sealed = VaultCrypto::new(first, FileHasher::default())
            .encrypt(b"payload")
            .unwrap();
        let opened = VaultCrypto::new(second, FileHasher::default())
            .decrypt(&sealed)
            .unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn wrong_key_length_rejected() {
        assert!(EncryptionKey::from_bytes(&[0u8; 16]).is_err());
    }
}
