use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::EngineError;

/// Computes a deterministic SHA-256 hash over artifact bytes.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Streams a closed artifact through SHA-256, returning the hex digest and the
/// number of bytes read.
pub fn file_checksum(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("read artifact: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Mismatch(#[from] EngineError),
}

/// Fails with `ChecksumMismatch` when the artifact no longer matches the digest
/// recorded at creation time.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), VerifyError> {
    let (actual, _) = file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(EngineError::ChecksumMismatch {
            expected: expected.to_owned(),
            actual,
        }
        .into())
    }
}
