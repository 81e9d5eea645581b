//! Content digests for change detection, backups, and restore verification.
//!
//! Two algorithms are supported: BLAKE3 as the fast default, SHA-256 where a
//! standard cryptographic digest is preferred. Files are streamed through the
//! hasher in 64 KiB chunks so large inputs never have to be buffered twice.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
            Self::Sha256 => "sha256",
        }
    }
}

/// Digest an in-memory buffer, returning the lowercase hex string.
pub fn digest_bytes(algorithm: ChecksumAlgorithm, data: &[u8]) -> String {
    match algorithm {
        ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
    }
}

/// Stream a file through the digest. Returns the hex digest together with
/// the number of bytes read.
pub fn digest_file(algorithm: ChecksumAlgorithm, path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    match algorithm {
        ChecksumAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                size += n as u64;
                hasher.update(&buf[..n]);
            }
            Ok((hasher.finalize().to_hex().to_string(), size))
        }
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                size += n as u64;
                hasher.update(&buf[..n]);
            }
            Ok((hex::encode(hasher.finalize()), size))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn digest_bytes_matches_digest_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let content = b"name,phone\nBook Haven,555-0101\n";
        File::create(&path).unwrap().write_all(content).unwrap();

        for algorithm in [ChecksumAlgorithm::Blake3, ChecksumAlgorithm::Sha256] {
            let from_bytes = digest_bytes(algorithm, content);
            let (from_file, size) = digest_file(algorithm, &path).unwrap();
            assert_eq!(from_bytes, from_file);
            assert_eq!(size, content.len() as u64);
        }
    }

    #[test]
    fn algorithms_produce_distinct_digests() {
        let data = b"tablekeeper";
        assert_ne!(
            digest_bytes(ChecksumAlgorithm::Blake3, data),
            digest_bytes(ChecksumAlgorithm::Sha256, data)
        );
    }
}
