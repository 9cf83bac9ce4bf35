//! Streaming content digests.
//!
//! Files are read in fixed-size chunks so memory use stays bounded no matter
//! how large the protected file is. Digests are lowercase hex.

use crate::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Default chunk size for streaming reads (64KB)
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

#[derive(Debug, Clone)]
pub struct FileHasher {
    algorithm: HashAlgorithm,
    chunk_bytes: usize,
}

impl FileHasher {
    pub fn new(algorithm: HashAlgorithm, chunk_bytes: usize) -> Self {
        Self {
            algorithm,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    /// Hash a file. A missing file is `GuardError::NotFound`.
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).map_err(|e| GuardError::io(path, e))?;
        match self.algorithm {
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                self.stream(&mut file, path, |chunk| hasher.update(chunk))?;
                Ok(hex::encode(hasher.finalize()))
            }
            HashAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                self.stream(&mut file, path, |chunk| {
                    hasher.update(chunk);
                })?;
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }

    pub fn hash_bytes(&self, data: &[u8]) -> String {
        match self.algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            HashAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    fn stream<R: Read>(
        &self,
        reader: &mut R,
        path: &Path,
        mut update: impl FnMut(&[u8]),
    ) -> Result<()> {
        let mut buffer = vec![0u8; self.chunk_bytes];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => return Ok(()),
                Ok(n) => update(&buffer[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(GuardError::io(path, e)),
            }
        }
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::Sha256, DEFAULT_CHUNK_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn sha256_matches_known_digest() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let hasher = FileHasher::default();
        assert_eq!(
            hasher.hash_file(file.path()).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn chunking_does_not_change_digest() {
        let mut file = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&content).unwrap();

        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Blake3] {
            let small = FileHasher::new(algorithm, 512);
            let large = FileHasher::new(algorithm, 1 << 20);
            let streamed = small.hash_file(file.path()).unwrap();
            assert_eq!(streamed, large.hash_file(file.path()).unwrap());
            assert_eq!(streamed, small.hash_bytes(&content));
            assert_eq!(streamed.len(), 64);
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileHasher::default()
            .hash_file(&dir.path().join("absent"))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
