//! Image verification: filesystem probe plus a read-only tree diff.

use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::cancel::CancelFlag;
use super::format::FsKind;
use super::reaper::Reaper;
use super::sync::SyncOptions;
use crate::error::{BuildError, CleanupWarning};
use crate::host::Host;
use crate::privilege;

/// Directory mkfs.ext4 creates at the filesystem root.
const LOST_AND_FOUND: &str = "lost+found";

/// One way an image tree differs from its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeDifference {
    Missing {
        path: PathBuf,
    },
    Unexpected {
        path: PathBuf,
    },
    TypeMismatch {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },
    ContentMismatch {
        path: PathBuf,
    },
    ModeMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    LinkTargetMismatch {
        path: PathBuf,
        expected: PathBuf,
        found: PathBuf,
    },
}

impl fmt::Display for TreeDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TreeDifference::Missing { path } => write!(f, "missing: {}", path.display()),
            TreeDifference::Unexpected { path } => write!(f, "unexpected: {}", path.display()),
            TreeDifference::TypeMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "type differs: {} (expected {}, found {})",
                path.display(),
                expected,
                found
            ),
            TreeDifference::ContentMismatch { path } => {
                write!(f, "content differs: {}", path.display())
            }
            TreeDifference::ModeMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "mode differs: {} (expected {:04o}, found {:04o})",
                path.display(),
                expected,
                found
            ),
            TreeDifference::LinkTargetMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "link target differs: {} (expected {}, found {})",
                path.display(),
                expected.display(),
                found.display()
            ),
        }
    }
}

/// Outcome of `verify_image`.
#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub image: PathBuf,
    pub fs_type: String,
    pub compared_against: Option<PathBuf>,
    pub differences: Vec<TreeDifference>,
    pub cleanup_warnings: Vec<CleanupWarning>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.differences.is_empty()
    }
}

/// Where to mount the image when comparing trees.
#[derive(Debug, Clone)]
pub struct VerifyTarget<'a> {
    pub image: &'a Path,
    pub kind: FsKind,
    pub against: Option<&'a Path>,
    pub mount_base: &'a Path,
    pub mount_prefix: &'a str,
}

/// Check that `image` carries a `kind` filesystem.
pub fn probe<H: Host>(host: &H, image: &Path, kind: FsKind) -> Result<String, BuildError> {
    let found = host
        .probe_fs_type(image)
        .map_err(|e| BuildError::FormatFailed {
            path: image.to_path_buf(),
            reason: format!("probe failed: {:#}", e),
        })?;
    match found {
        Some(fs_type) if fs_type == kind.as_str() => Ok(fs_type),
        Some(other) => Err(BuildError::FormatFailed {
            path: image.to_path_buf(),
            reason: format!("expected {} filesystem, found {}", kind, other),
        }),
        None => Err(BuildError::FormatFailed {
            path: image.to_path_buf(),
            reason: "no filesystem signature found".to_string(),
        }),
    }
}

/// Probe the image and, when a source is given, mount it read-only and
/// diff it against that source.
pub fn verify_image<H: Host>(
    host: &H,
    target: &VerifyTarget<'_>,
    cancel: &CancelFlag,
) -> Result<VerifyReport, BuildError> {
    let fs_type = probe(host, target.image, target.kind)?;
    tracing::info!(image = %target.image.display(), fs_type, "filesystem recognized");

    let mut report = VerifyReport {
        image: target.image.to_path_buf(),
        fs_type,
        compared_against: target.against.map(Path::to_path_buf),
        differences: Vec::new(),
        cleanup_warnings: Vec::new(),
    };
    let Some(source) = target.against else {
        return Ok(report);
    };

    privilege::ensure_privileged(host)?;
    super::ensure_outside_tree(source, target.mount_base, "mount base")?;
    cancel.check("attach")?;

    let mut reaper = Reaper::register(host);
    let result = (|| {
        reaper.attach(target.image)?;
        reaper.create_mount_point(target.mount_base, target.mount_prefix)?;
        cancel.check("mount")?;
        let root = reaper.mount(target.kind, true)?.to_path_buf();
        cancel.check("compare")?;
        Ok::<_, BuildError>(diff_trees(
            source,
            &root,
            SyncOptions::for_fs(target.kind),
        )?)
    })();
    report.cleanup_warnings = reaper.reap();

    report.differences = result?;
    if report.is_clean() {
        tracing::info!(source = %source.display(), "image matches source");
    } else {
        tracing::warn!(
            count = report.differences.len(),
            "image differs from source"
        );
    }
    Ok(report)
}

/// Compare the tree at `image_root` against `source`.
///
/// Directories, regular files and symlinks must match by relative path and
/// type; files by content, symlinks by target, and permission bits when the
/// filesystem stores them. `lost+found` at the image root is ignored.
pub fn diff_trees(
    source: &Path,
    image_root: &Path,
    options: SyncOptions,
) -> io::Result<Vec<TreeDifference>> {
    let mut differences = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = relative(source, entry.path())?;
        let src_meta = entry.metadata()?;
        let kind = entry_kind(&src_meta);
        if kind == "other" || (kind == "symlink" && !options.unix_metadata) {
            continue;
        }
        seen.insert(rel.clone());

        let image_path = image_root.join(&rel);
        let img_meta = match fs::symlink_metadata(&image_path) {
            Ok(meta) => meta,
            Err(e)
                if e.kind() == io::ErrorKind::NotFound
                    || e.raw_os_error() == Some(libc::ENOTDIR) =>
            {
                differences.push(TreeDifference::Missing { path: rel });
                continue;
            }
            Err(e) => return Err(e),
        };
        let found = entry_kind(&img_meta);
        if found != kind {
            differences.push(TreeDifference::TypeMismatch {
                path: rel,
                expected: kind,
                found,
            });
            continue;
        }

        match kind {
            "file" => {
                if !same_content(entry.path(), &image_path)? {
                    differences.push(TreeDifference::ContentMismatch { path: rel.clone() });
                }
            }
            "symlink" => {
                let expected = fs::read_link(entry.path())?;
                let found = fs::read_link(&image_path)?;
                if expected != found {
                    differences.push(TreeDifference::LinkTargetMismatch {
                        path: rel.clone(),
                        expected,
                        found,
                    });
                }
            }
            _ => {}
        }

        if options.unix_metadata && kind != "symlink" {
            let (expected, found) = (src_meta.mode() & 0o7777, img_meta.mode() & 0o7777);
            if expected != found {
                differences.push(TreeDifference::ModeMismatch {
                    path: rel,
                    expected,
                    found,
                });
            }
        }
    }

    for entry in WalkDir::new(image_root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == LOST_AND_FOUND))
    {
        let entry = entry?;
        let rel = relative(image_root, entry.path())?;
        if !seen.contains(&rel) && entry_kind(&entry.metadata()?) != "other" {
            differences.push(TreeDifference::Unexpected { path: rel });
        }
    }

    Ok(differences)
}

fn relative(root: &Path, path: &Path) -> io::Result<PathBuf> {
    path.strip_prefix(root)
        .map(Path::to_path_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn entry_kind(meta: &fs::Metadata) -> &'static str {
    let ft = meta.file_type();
    if ft.is_dir() {
        "dir"
    } else if ft.is_file() {
        "file"
    } else if ft.is_symlink() {
        "symlink"
    } else {
        "other"
    }
}

fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut ba = vec![0u8; 64 * 1024];
    let mut bb = vec![0u8; 64 * 1024];
    loop {
        let n = ra.read(&mut ba)?;
        if n == 0 {
            return Ok(true);
        }
        rb.read_exact(&mut bb[..n])?;
        if ba[..n] != bb[..n] {
            return Ok(false);
        }
    }
}
