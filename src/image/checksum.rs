//! SHA-256 sidecar for finished images.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Hex SHA-256 of a file, streamed in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// `<image>.sha256` next to the image.
pub fn checksum_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Hash `image` and write a `sha256sum -c` compatible sidecar.
/// Returns the hex digest.
pub fn write_checksum_file(image: &Path) -> Result<String> {
    let digest = sha256_file(image)?;
    let file_name = image
        .file_name()
        .with_context(|| format!("{} has no file name", image.display()))?;
    let sidecar = checksum_path(image);
    fs::write(
        &sidecar,
        format!("{}  {}\n", digest, file_name.to_string_lossy()),
    )
    .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    tracing::info!(path = %sidecar.display(), "checksum written");
    Ok(digest)
}
