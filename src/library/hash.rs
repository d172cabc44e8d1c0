use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Content digest and size of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256.
    pub hash: String,
    /// Bytes read.
    pub size: u64,
}

/// Hash a whole file with SHA-256, streaming it through a fixed buffer.
pub fn sha256_file(path: &Path) -> Result<FileDigest> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    let mut size = 0_u64;

    loop {
        let count = file.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
        size += count as u64;
    }

    Ok(FileDigest {
        hash: format!("{:x}", hasher.finalize()),
        size,
    })
}
