//! Error taxonomy for the image pipeline.
//!
//! Every fatal failure is a [`BuildError`]. The first one raised is the one
//! reported; cleanup problems are [`CleanupWarning`] values that get logged
//! and recorded, never returned.

use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal pipeline errors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The process lacks the privilege for loop devices and mounts.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The source directory is missing, not a directory, or unreadable.
    #[error("invalid source tree {path}: {reason}")]
    InvalidSource { path: PathBuf, reason: String },

    /// The host filesystem cannot hold the declared image size.
    #[error("insufficient space for {path} ({requested} bytes): {reason}")]
    InsufficientSpace {
        path: PathBuf,
        requested: u64,
        reason: String,
    },

    /// Filesystem creation on the backing file failed.
    #[error("format of {path} failed: {reason}")]
    FormatFailed { path: PathBuf, reason: String },

    /// No loop device could be bound to the backing file.
    #[error("loop attach of {path} failed: {reason}")]
    AttachFailed { path: PathBuf, reason: String },

    /// The kernel rejected the mount, or the target was unusable.
    #[error("mount at {target} failed: {reason}")]
    MountFailed { target: PathBuf, reason: String },

    /// A source entry could not be read or a destination entry written.
    #[error("copy of {path} failed: {reason}")]
    CopyFailed { path: PathBuf, reason: String },

    /// Internal sequencing violation (e.g. mounting an active session).
    #[error("improper use: {0}")]
    ImproperUse(String),

    /// A termination signal was received mid-pipeline.
    #[error("interrupted by signal during {0}")]
    Interrupted(&'static str),

    /// Host I/O outside a classified stage.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl BuildError {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::PermissionDenied(_) => 77,
            BuildError::InvalidSource { .. } => 66,
            BuildError::InsufficientSpace { .. } => 73,
            BuildError::FormatFailed { .. } => 70,
            BuildError::AttachFailed { .. } => 71,
            BuildError::MountFailed { .. } => 72,
            BuildError::CopyFailed { .. } => 74,
            BuildError::ImproperUse(_) => 75,
            BuildError::Interrupted(_) => 130,
            BuildError::Io(_) => 1,
        }
    }

    /// Short kind name, used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::PermissionDenied(_) => "PermissionDenied",
            BuildError::InvalidSource { .. } => "InvalidSource",
            BuildError::InsufficientSpace { .. } => "InsufficientSpace",
            BuildError::FormatFailed { .. } => "FormatFailed",
            BuildError::AttachFailed { .. } => "AttachFailed",
            BuildError::MountFailed { .. } => "MountFailed",
            BuildError::CopyFailed { .. } => "CopyFailed",
            BuildError::ImproperUse(_) => "ImproperUse",
            BuildError::Interrupted(_) => "Interrupted",
            BuildError::Io(_) => "Io",
        }
    }

    pub(crate) fn copy(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        BuildError::CopyFailed {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}

/// Which release step a cleanup warning came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    Unmount,
    Detach,
    RemoveMountDir,
    RemoveImage,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CleanupStep::Unmount => "unmount",
            CleanupStep::Detach => "detach",
            CleanupStep::RemoveMountDir => "remove mount dir",
            CleanupStep::RemoveImage => "remove image",
        };
        f.write_str(s)
    }
}

/// A non-fatal failure during resource release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub step: CleanupStep,
    pub target: PathBuf,
    pub message: String,
}

impl CleanupWarning {
    pub fn new(step: CleanupStep, target: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        let warning = Self {
            step,
            target: target.into(),
            message: message.to_string(),
        };
        tracing::warn!(
            step = %warning.step,
            path = %warning.target.display(),
            "cleanup step failed: {}",
            warning.message
        );
        warning
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.step, self.target.display(), self.message)
    }
}
