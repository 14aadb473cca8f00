//! Filesystem formatter.

use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use super::backing::BackingFile;
use crate::error::BuildError;
use crate::host::Host;
use crate::process::Cmd;

/// Longest volume label mkfs.ext4 accepts.
const EXT4_LABEL_MAX: usize = 16;

/// Longest volume label mkfs.vfat accepts.
const VFAT_LABEL_MAX: usize = 11;

/// Filesystem written onto the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    /// ext4 root filesystem
    #[default]
    Ext4,
    /// FAT32 boot partition
    Vfat,
}

impl FsKind {
    /// Type name used by mount and blkid.
    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "vfat",
        }
    }

    /// Whether ownership, modes, symlinks and device nodes survive a copy.
    pub fn supports_unix_metadata(&self) -> bool {
        matches!(self, FsKind::Ext4)
    }

    /// Check a volume label against the formatter's limits.
    pub fn validate_label(&self, label: &str) -> Result<(), String> {
        let max = match self {
            FsKind::Ext4 => EXT4_LABEL_MAX,
            FsKind::Vfat => VFAT_LABEL_MAX,
        };
        if label.is_empty() {
            return Err("label must not be empty".to_string());
        }
        if label.len() > max {
            return Err(format!(
                "{} label '{}' is longer than {} bytes",
                self, label, max
            ));
        }
        Ok(())
    }

    /// mkfs invocation that forces creation over any existing signature.
    pub fn mkfs_command(&self, image: &Path, label: Option<&str>) -> Cmd {
        let cmd = match self {
            FsKind::Ext4 => {
                let mut cmd = Cmd::new("mkfs.ext4").args(["-F", "-q"]);
                if let Some(label) = label {
                    cmd = cmd.args(["-L", label]);
                }
                cmd.error_msg("mkfs.ext4 failed")
            }
            FsKind::Vfat => {
                let mut cmd = Cmd::new("mkfs.vfat").args(["-F", "32"]);
                if let Some(label) = label {
                    cmd = cmd.args(["-n", label]);
                }
                cmd.error_msg("mkfs.vfat failed")
            }
        };
        cmd.arg_path(image)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ext4" => Ok(FsKind::Ext4),
            "vfat" | "fat32" => Ok(FsKind::Vfat),
            other => Err(format!("unsupported filesystem type '{}'", other)),
        }
    }
}

/// Write a fresh filesystem onto the backing file.
pub fn format_image<H: Host>(
    host: &H,
    backing: &BackingFile,
    kind: FsKind,
    label: Option<&str>,
) -> Result<(), BuildError> {
    tracing::info!(
        image = %backing.path().display(),
        bytes = backing.size(),
        fs = %kind,
        "formatting"
    );

    host.format(backing.path(), kind, label)
        .map_err(|e| BuildError::FormatFailed {
            path: backing.path().to_path_buf(),
            reason: format!("{:#}", e),
        })
}
