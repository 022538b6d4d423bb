//! SHA-256 verification of finished downloads.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::TransportError;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the lowercase hex SHA-256 of a file.
pub async fn file_sha256(path: &Path) -> Result<String, TransportError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| TransportError::io(path, &e))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransportError::io(path, &e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected digest.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<(), TransportError> {
    let actual = file_sha256(path).await?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(TransportError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHA-256 of "hello world"
    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[tokio::test]
    async fn test_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(file_sha256(&path).await.unwrap(), HELLO_SHA256);
    }

    #[tokio::test]
    async fn test_verify_sha256_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert!(verify_sha256(&path, HELLO_SHA256).await.is_ok());
        assert!(verify_sha256(&path, &HELLO_SHA256.to_uppercase())
            .await
            .is_ok());
        assert!(matches!(
            verify_sha256(&path, "abc123").await,
            Err(TransportError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = file_sha256(&dir.path().join("missing")).await;
        assert!(matches!(result, Err(TransportError::Io { .. })));
    }
}
