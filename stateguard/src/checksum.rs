//! SHA-256 checksums for artifacts.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::utils::errors::{Result, StateguardError};

const READ_BUFFER: usize = 64 * 1024;

/// Hash a file's contents, returning lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash on the blocking pool so large dumps don't stall the runtime.
pub async fn sha256_file_async(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| StateguardError::Transient(format!("checksum task failed: {e}")))?
}
