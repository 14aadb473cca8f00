//! Image pipeline.
//!
//! Stages run strictly in order, each on the completed side effect of the
//! previous one:
//!
//! ```text
//! privilege -> source -> allocate -> format -> attach -> mount -> copy -> reap
//! ```
//!
//! The [`Reaper`] is registered before the first stage that creates a
//! releasable resource, owns the loop device and mount session from the
//! moment they exist, and releases them on every exit path.

mod backing;
mod cancel;
mod checksum;
mod format;
mod loopdev;
mod mount;
mod reaper;
mod sync;
mod verify;

use serde::Serialize;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BuildError, CleanupWarning};
use crate::host::Host;
use crate::privilege;
use crate::timing::Timer;

pub use backing::{allocate, available_space, AllocStrategy, BackingFile, MIB};
pub use cancel::CancelFlag;
pub use checksum::{checksum_path, sha256_file, write_checksum_file};
pub use format::{format_image, FsKind};
pub use loopdev::LoopDevice;
pub use mount::{MountPoint, MountSession};
pub use reaper::Reaper;
pub use sync::{mirror_tree, SyncOptions, SyncStats};
pub use verify::{diff_trees, probe, verify_image, TreeDifference, VerifyReport, VerifyTarget};

/// Default image size in MiB.
pub const DEFAULT_SIZE_MIB: u64 = 512;

/// Default mount point name prefix.
pub const DEFAULT_MOUNT_PREFIX: &str = "rootfs_mount_";

/// Everything one build needs.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub source: PathBuf,
    pub output: PathBuf,
    pub size_bytes: u64,
    pub fs_kind: FsKind,
    pub label: Option<String>,
    pub mount_base: PathBuf,
    pub mount_prefix: String,
}

impl ImageSpec {
    /// Spec with default size, kind and mount location.
    pub fn new(source: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            size_bytes: DEFAULT_SIZE_MIB * MIB,
            fs_kind: FsKind::default(),
            label: None,
            mount_base: std::env::temp_dir(),
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
        }
    }
}

/// Forward progress of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Backing file allocated, no filesystem yet.
    Unformatted,
    Formatted,
    Attached,
    Mounted,
    Populated,
    /// Everything released after a successful copy.
    Cleaned,
}

/// Elapsed time for one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub seconds: f64,
}

/// What a build did. Written as JSON by `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub size_bytes: u64,
    /// Blocks actually held on the host filesystem.
    pub allocated_bytes: Option<u64>,
    pub fs_kind: FsKind,
    pub label: Option<String>,
    pub allocation: Option<AllocStrategy>,
    /// Last stage reached.
    pub stage: Option<Stage>,
    pub copied: SyncStats,
    pub cleanup_warnings: Vec<CleanupWarning>,
    pub timings: Vec<StageTiming>,
    pub sha256: Option<String>,
    pub error: Option<String>,
}

impl BuildReport {
    fn new(spec: &ImageSpec) -> Self {
        Self {
            source: spec.source.clone(),
            output: spec.output.clone(),
            size_bytes: spec.size_bytes,
            allocated_bytes: None,
            fs_kind: spec.fs_kind,
            label: spec.label.clone(),
            allocation: None,
            stage: None,
            copied: SyncStats::default(),
            cleanup_warnings: Vec::new(),
            timings: Vec::new(),
            sha256: None,
            error: None,
        }
    }

    /// Whether this run created (or truncated) the output file.
    pub fn created_output(&self) -> bool {
        self.allocation.is_some()
    }

    fn reached(&mut self, stage: Stage) {
        tracing::info!(?stage, "stage reached");
        self.stage = Some(stage);
    }

    fn timed(&mut self, stage: &'static str, timer: Timer) {
        let elapsed: Duration = timer.finish();
        self.timings.push(StageTiming {
            stage,
            seconds: elapsed.as_secs_f64(),
        });
    }
}

/// A finished build: the report plus the first fatal error, if any.
#[derive(Debug)]
pub struct BuildRun {
    pub report: BuildReport,
    pub error: Option<BuildError>,
}

impl BuildRun {
    pub fn into_result(self) -> Result<BuildReport, BuildError> {
        match self.error {
            None => Ok(self.report),
            Some(e) => Err(e),
        }
    }
}

/// Build the image described by `spec`.
pub fn build_image<H: Host>(
    host: &H,
    spec: &ImageSpec,
    cancel: &CancelFlag,
) -> Result<BuildReport, BuildError> {
    run_build(host, spec, cancel).into_result()
}

/// Build the image and keep the report even when a stage fails.
pub fn run_build<H: Host>(host: &H, spec: &ImageSpec, cancel: &CancelFlag) -> BuildRun {
    let mut report = BuildReport::new(spec);

    let result = check_inputs(host, spec, cancel).and_then(|()| {
        let mut reaper = Reaper::register(host);
        let result = run_stages(&mut reaper, host, spec, cancel, &mut report);
        report.cleanup_warnings = reaper.reap();
        result
    });

    match result {
        Ok(()) => {
            report.reached(Stage::Cleaned);
            BuildRun {
                report,
                error: None,
            }
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), stage = ?report.stage, "build failed: {}", e);
            report.error = Some(e.to_string());
            BuildRun {
                report,
                error: Some(e),
            }
        }
    }
}

/// Checks that must pass before anything is created.
fn check_inputs<H: Host>(host: &H, spec: &ImageSpec, cancel: &CancelFlag) -> Result<(), BuildError> {
    cancel.check("privilege")?;
    privilege::ensure_privileged(host)?;
    validate_source(&spec.source, &spec.output, &spec.mount_base)?;
    if let Some(label) = &spec.label {
        spec.fs_kind
            .validate_label(label)
            .map_err(BuildError::ImproperUse)?;
    }
    Ok(())
}

fn run_stages<H: Host>(
    reaper: &mut Reaper<'_, H>,
    host: &H,
    spec: &ImageSpec,
    cancel: &CancelFlag,
    report: &mut BuildReport,
) -> Result<(), BuildError> {
    cancel.check("allocate")?;
    let timer = Timer::start("Allocate backing file");
    let (backing, strategy) = allocate(&spec.output, spec.size_bytes)?;
    report.allocation = Some(strategy);
    report.allocated_bytes = fs::metadata(backing.path())
        .ok()
        .map(|m| m.blocks().saturating_mul(512));
    report.timed("allocate", timer);
    report.reached(Stage::Unformatted);

    cancel.check("format")?;
    let timer = Timer::start("Format filesystem");
    format_image(host, &backing, spec.fs_kind, spec.label.as_deref())?;
    report.timed("format", timer);
    report.reached(Stage::Formatted);

    cancel.check("attach")?;
    let timer = Timer::start("Attach loop device");
    reaper.attach(backing.path())?;
    report.timed("attach", timer);
    report.reached(Stage::Attached);

    let timer = Timer::start("Mount filesystem");
    reaper.create_mount_point(&spec.mount_base, &spec.mount_prefix)?;
    cancel.check("mount")?;
    let root = reaper.mount(spec.fs_kind, false)?.to_path_buf();
    report.timed("mount", timer);
    report.reached(Stage::Mounted);

    cancel.check("copy")?;
    let timer = Timer::start("Copy source tree");
    report.copied = mirror_tree(
        &spec.source,
        &root,
        SyncOptions::for_fs(spec.fs_kind),
        cancel,
    )?;
    report.timed("copy", timer);
    report.reached(Stage::Populated);

    Ok(())
}

/// The source must be a readable directory that contains neither the output
/// nor the mount base.
fn validate_source(source: &Path, output: &Path, mount_base: &Path) -> Result<(), BuildError> {
    let invalid = |reason: String| BuildError::InvalidSource {
        path: source.to_path_buf(),
        reason,
    };

    let meta = fs::metadata(source).map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    fs::read_dir(source).map_err(|e| invalid(format!("not readable: {}", e)))?;

    ensure_outside_tree(source, output, "output")?;
    ensure_outside_tree(source, mount_base, "mount base")
}

/// Reject `path` when it resolves to somewhere inside `tree`. A mount base
/// inside the tree would have the copy walk into its own mount.
pub(crate) fn ensure_outside_tree(tree: &Path, path: &Path, what: &str) -> Result<(), BuildError> {
    let invalid = |reason: String| BuildError::InvalidSource {
        path: tree.to_path_buf(),
        reason,
    };
    let tree = fs::canonicalize(tree).map_err(|e| invalid(e.to_string()))?;
    let resolved = resolve_existing_prefix(path)?;
    if resolved.starts_with(&tree) {
        return Err(invalid(format!(
            "{} {} lies inside the source tree",
            what,
            resolved.display()
        )));
    }
    Ok(())
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// rest, without creating anything.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, BuildError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut rest = Vec::new();
    let mut cursor = absolute.as_path();
    loop {
        if let Ok(resolved) = fs::canonicalize(cursor) {
            return Ok(rest.iter().rev().fold(resolved, |acc, c| acc.join(c)));
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                cursor = parent;
            }
            _ => return Ok(absolute),
        }
    }
}
