//! Streaming SHA-256 checksums for backup artifacts.

use crate::utils::errors::{BackupError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const BUFFER_SIZE: usize = 64 * 1024;

/// Hex-encoded SHA-256 of the file contents, read in fixed-size chunks.
pub async fn compute_checksum(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BackupError::from_io(e, path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

pub async fn verify(path: &Path, expected: &str) -> Result<bool> {
    let actual = compute_checksum(path).await?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Like [`verify`] but reports a mismatch as `ChecksumMismatch`.
pub async fn ensure_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = compute_checksum(path).await?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(BackupError::ChecksumMismatch {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
            expected: expected.to_string(),
            actual,
        })
    }
}
