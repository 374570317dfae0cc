use sha2::{Sha256, Digest};
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;
use crate::error::{Result, TidewaterError};

/// Compute SHA256 hash of file contents
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let content = std::fs::read(path)
        .map_err(TidewaterError::Io)?;
    Ok(hash_bytes(&content))
}

/// Compute SHA256 hash of the first `len` bytes of a file.
///
/// Fails if the file is shorter than `len`.
pub fn compute_prefix_hash(path: &Path, len: u64) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut prefix = Vec::new();
    file.take(len).read_to_end(&mut prefix)?;
    if (prefix.len() as u64) < len {
        return Err(TidewaterError::InvalidInput(format!(
            "{} is shorter than {} bytes",
            path.display(),
            len
        )));
    }
    Ok(hash_bytes(&prefix))
}

/// Hex SHA256 of an in-memory buffer
pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Modification time as fractional seconds since the Unix epoch.
///
/// Times before the epoch come out negative.
pub fn mod_date_seconds(modified: SystemTime) -> f64 {
    match modified.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}
