//! Backing store allocator.
//!
//! Reserves the image file with `fallocate(2)` (no data written) and falls
//! back to writing zeros when the host filesystem does not implement it.
//! On return the file has exactly the requested length.

use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Bytes per MiB.
pub const MIB: u64 = 1024 * 1024;

/// Chunk size for the zero-fill fallback.
const ZERO_CHUNK: usize = MIB as usize;

/// How the backing file got its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStrategy {
    /// `fallocate(2)`: instant, no data written.
    Fallocate,
    /// Explicit zero writes.
    ZeroFill,
}

/// The image file the loop device will be bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingFile {
    path: PathBuf,
    size: u64,
}

impl BackingFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared capacity in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Allocate `size` bytes at `path`, preferring `fallocate`.
pub fn allocate(path: &Path, size: u64) -> Result<(BackingFile, AllocStrategy), BuildError> {
    if size == 0 {
        return Err(BuildError::ImproperUse(
            "backing file size must be at least 1 byte".to_string(),
        ));
    }

    let parent = parent_dir(path);
    fs::create_dir_all(&parent)?;
    check_free_space(path, &parent, size)?;

    let file = create_truncated(path)?;
    let strategy = match fallocate(&file, size) {
        Ok(()) => AllocStrategy::Fallocate,
        Err(e) if is_unsupported(&e) => {
            tracing::info!(
                path = %path.display(),
                "fallocate not supported here, falling back to zero fill"
            );
            zero_fill(&file, size).map_err(|e| allocation_error(path, size, e))?;
            AllocStrategy::ZeroFill
        }
        Err(e) => return Err(allocation_error(path, size, e)),
    };

    finish(file, path, size)?;
    tracing::info!(path = %path.display(), bytes = size, ?strategy, "backing file allocated");
    Ok((
        BackingFile {
            path: path.to_path_buf(),
            size,
        },
        strategy,
    ))
}

/// Free bytes available to unprivileged writers on the filesystem at `dir`.
pub fn available_space(dir: &Path) -> io::Result<u64> {
    let stat = rustix::fs::statvfs(dir)?;
    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn check_free_space(path: &Path, parent: &Path, size: u64) -> Result<(), BuildError> {
    let available = available_space(parent)?;
    // Blocks held by a previous image at the same path are released by the
    // truncate, so they count as available.
    let reclaimable = fs::metadata(path)
        .map(|m| m.blocks().saturating_mul(512))
        .unwrap_or(0);
    let usable = available.saturating_add(reclaimable);

    if size > usable {
        return Err(BuildError::InsufficientSpace {
            path: path.to_path_buf(),
            requested: size,
            reason: format!("only {} bytes available in {}", usable, parent.display()),
        });
    }
    Ok(())
}

fn create_truncated(path: &Path) -> Result<File, BuildError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(BuildError::from)
}

fn fallocate(file: &File, size: u64) -> io::Result<()> {
    let len = libc::off_t::try_from(size)
        .map_err(|_| io::Error::from_raw_os_error(libc::EFBIG))?;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn zero_fill(mut file: &File, size: u64) -> io::Result<()> {
    let chunk = vec![0u8; ZERO_CHUNK];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&chunk[..n])?;
        remaining -= n as u64;
    }
    file.flush()
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
    )
}

fn is_out_of_space(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSPC) | Some(libc::EDQUOT) | Some(libc::EFBIG)
    )
}

/// Classify an allocation failure and drop the partial file.
fn allocation_error(path: &Path, size: u64, err: io::Error) -> BuildError {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), "could not remove partial image: {}", e);
    }
    if is_out_of_space(&err) {
        BuildError::InsufficientSpace {
            path: path.to_path_buf(),
            requested: size,
            reason: err.to_string(),
        }
    } else {
        BuildError::Io(err)
    }
}

fn finish(file: File, path: &Path, size: u64) -> Result<(), BuildError> {
    file.sync_all()?;
    drop(file);

    let actual = fs::metadata(path)?.len();
    if actual != size {
        return Err(BuildError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{} is {} bytes after allocation, expected {}",
                path.display(),
                actual,
                size
            ),
        )));
    }
    Ok(())
}
