//! Content synchronizer.
//!
//! Mirrors a source tree into a destination directory the way `rsync -a`
//! does: regular files, directories, symlinks, device nodes and FIFOs, with
//! ownership, permission bits and timestamps. Nothing at the destination is
//! deleted except non-directory entries that a source entry replaces.
//! Directory metadata is applied after the directory's contents, deepest
//! first, so restrictive modes and mtimes survive the copy.

use serde::Serialize;
use std::ffi::CString;
use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::cancel::CancelFlag;
use super::format::FsKind;
use crate::error::BuildError;

/// What metadata the destination filesystem can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Copy uid/gid (needs privilege).
    pub preserve_owner: bool,
    /// Copy permission bits, symlinks and device nodes.
    pub unix_metadata: bool,
}

impl SyncOptions {
    pub fn for_fs(kind: FsKind) -> Self {
        Self {
            preserve_owner: kind.supports_unix_metadata(),
            unix_metadata: kind.supports_unix_metadata(),
        }
    }
}

/// Counts of mirrored entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub special: u64,
    pub skipped: u64,
    pub bytes: u64,
}

/// Mirror `src` into `dst`. `dst` must already exist.
pub fn mirror_tree(
    src: &Path,
    dst: &Path,
    options: SyncOptions,
    cancel: &CancelFlag,
) -> Result<SyncStats, BuildError> {
    tracing::info!(source = %src.display(), dest = %dst.display(), "copying tree");

    let mut stats = SyncStats::default();
    let mut dirs: Vec<(PathBuf, Metadata)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        cancel.check("copy")?;

        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            BuildError::copy(path, e)
        })?;
        let src_path = entry.path();
        let rel = src_path
            .strip_prefix(src)
            .map_err(|e| BuildError::copy(src_path, e))?;
        let dst_path = dst.join(rel);
        let meta = entry
            .metadata()
            .map_err(|e| BuildError::copy(src_path, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            if entry.depth() > 0 {
                ensure_dir(&dst_path)?;
                stats.dirs += 1;
            }
            dirs.push((dst_path, meta));
        } else if file_type.is_file() {
            replace_non_dir(&dst_path)?;
            let bytes = fs::copy(src_path, &dst_path).map_err(|e| BuildError::copy(src_path, e))?;
            apply_metadata(&dst_path, &meta, options)?;
            stats.files += 1;
            stats.bytes += bytes;
        } else if file_type.is_symlink() {
            if !options.unix_metadata {
                skip(&mut stats, src_path, "symlink");
                continue;
            }
            let target = fs::read_link(src_path).map_err(|e| BuildError::copy(src_path, e))?;
            replace_non_dir(&dst_path)?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .map_err(|e| BuildError::copy(&dst_path, e))?;
            apply_metadata(&dst_path, &meta, options)?;
            stats.symlinks += 1;
        } else if file_type.is_block_device() || file_type.is_char_device() || file_type.is_fifo() {
            if !options.unix_metadata {
                skip(&mut stats, src_path, "special file");
                continue;
            }
            replace_non_dir(&dst_path)?;
            make_special(&dst_path, &meta)?;
            apply_metadata(&dst_path, &meta, options)?;
            stats.special += 1;
        } else {
            skip(&mut stats, src_path, "socket");
        }
    }

    for (path, meta) in dirs.iter().rev() {
        apply_metadata(path, meta, options)?;
    }

    tracing::info!(
        files = stats.files,
        dirs = stats.dirs,
        symlinks = stats.symlinks,
        special = stats.special,
        skipped = stats.skipped,
        bytes = stats.bytes,
        "tree copied"
    );
    Ok(stats)
}

fn skip(stats: &mut SyncStats, path: &Path, what: &str) {
    tracing::warn!(path = %path.display(), "skipping {}: not representable on target", what);
    stats.skipped += 1;
}

/// Make `path` a directory, replacing a non-directory entry if present.
fn ensure_dir(path: &Path) -> Result<(), BuildError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => fs::remove_file(path).map_err(|e| BuildError::copy(path, e))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BuildError::copy(path, e)),
    }
    fs::create_dir(path).map_err(|e| BuildError::copy(path, e))
}

/// Clear the way for a non-directory entry. Existing directories are never
/// removed.
fn replace_non_dir(path: &Path) -> Result<(), BuildError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(BuildError::copy(
            path,
            "destination is a directory, refusing to replace it",
        )),
        Ok(_) => fs::remove_file(path).map_err(|e| BuildError::copy(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::copy(path, e)),
    }
}

fn c_path(path: &Path) -> Result<CString, BuildError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| BuildError::copy(path, e))
}

fn make_special(path: &Path, meta: &Metadata) -> Result<(), BuildError> {
    let c = c_path(path)?;
    let ret = if meta.file_type().is_fifo() {
        // SAFETY: c is a valid NUL-terminated path.
        unsafe { libc::mkfifo(c.as_ptr(), (meta.mode() & 0o7777) as libc::mode_t) }
    } else {
        // SAFETY: c is a valid NUL-terminated path; mode carries the node type.
        unsafe { libc::mknod(c.as_ptr(), meta.mode() as libc::mode_t, meta.rdev() as libc::dev_t) }
    };
    if ret != 0 {
        return Err(BuildError::copy(path, io::Error::last_os_error()));
    }
    Ok(())
}

/// Owner, then mode (chown clears setuid/setgid), then timestamps.
fn apply_metadata(path: &Path, meta: &Metadata, options: SyncOptions) -> Result<(), BuildError> {
    let is_symlink = meta.file_type().is_symlink();

    if options.preserve_owner {
        std::os::unix::fs::lchown(path, Some(meta.uid()), Some(meta.gid()))
            .map_err(|e| BuildError::copy(path, e))?;
    }
    if options.unix_metadata && !is_symlink {
        fs::set_permissions(path, Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| BuildError::copy(path, e))?;
    }
    set_times(path, meta, is_symlink)
}

fn set_times(path: &Path, meta: &Metadata, is_symlink: bool) -> Result<(), BuildError> {
    let c = c_path(path)?;
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as _,
        },
    ];
    // SAFETY: c is NUL-terminated and times points at two timespecs.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // Some filesystems cannot timestamp symlinks.
        if is_symlink && err.raw_os_error() == Some(libc::ENOTSUP) {
            return Ok(());
        }
        return Err(BuildError::copy(path, err));
    }
    Ok(())
}
