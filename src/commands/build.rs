//! Build command - produces a filesystem image from a directory tree.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::Config;
use crate::error::{CleanupStep, CleanupWarning};
use crate::host::Host;
use crate::image::{self, BuildReport, CancelFlag, FsKind, ImageSpec, MIB};
use crate::timing::format_elapsed;

/// Options for one `rootimg build` invocation. `None` falls back to the
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    pub source: PathBuf,
    pub output: PathBuf,
    pub size_mb: Option<u64>,
    pub fs_kind: Option<FsKind>,
    pub label: Option<String>,
    /// Delete the output image when the build fails.
    pub remove_on_failure: bool,
    /// Write `<output>.sha256` after a successful build.
    pub checksum: bool,
    /// Write a JSON build report here, on success and on failure.
    pub report: Option<PathBuf>,
}

/// Merge CLI arguments over configuration.
pub fn image_spec(args: &BuildArgs, config: &Config) -> Result<ImageSpec> {
    let size_mib = args.size_mb.unwrap_or(config.size_mib);
    if size_mib == 0 {
        bail!("Image size must be at least 1 MiB");
    }
    let size_bytes = size_mib
        .checked_mul(MIB)
        .with_context(|| format!("Image size {} MiB is too large", size_mib))?;

    Ok(ImageSpec {
        source: args.source.clone(),
        output: args.output.clone(),
        size_bytes,
        fs_kind: args.fs_kind.unwrap_or(config.fs_kind),
        label: args.label.clone().or_else(|| config.label.clone()),
        mount_base: config.mount_base.clone(),
        mount_prefix: config.mount_prefix.clone(),
    })
}

/// Execute the build command.
pub fn cmd_build<H: Host>(
    host: &H,
    args: &BuildArgs,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let spec = image_spec(args, config)?;

    println!("=== Building {} image ===", spec.fs_kind);
    println!("  Source: {}", spec.source.display());
    println!("  Output: {}", spec.output.display());
    println!("  Size:   {} MiB\n", spec.size_bytes / MIB);
    let build_start = Instant::now();

    let run = image::run_build(host, &spec, cancel);
    let mut report = run.report;

    if let Some(err) = run.error {
        if args.remove_on_failure && report.created_output() {
            remove_output(&spec.output, &mut report);
        }
        // The build error is the one reported; a report failure only warns.
        if let Err(e) = write_report(args.report.as_deref(), &report) {
            tracing::warn!("{:#}", e);
        }
        for warning in &report.cleanup_warnings {
            eprintln!("[WARN] {}", warning);
        }
        return Err(err.into());
    }

    if args.checksum {
        let digest = image::write_checksum_file(&spec.output)?;
        println!("  sha256: {}", digest);
        report.sha256 = Some(digest);
    }
    write_report(args.report.as_deref(), &report)?;

    print_summary(&report);
    println!(
        "\n=== Build Complete ({}) ===",
        format_elapsed(build_start.elapsed())
    );
    Ok(())
}

fn remove_output(output: &Path, report: &mut BuildReport) {
    match fs::remove_file(output) {
        Ok(()) => println!("  Removed incomplete image {}", output.display()),
        Err(e) => report.cleanup_warnings.push(CleanupWarning::new(
            CleanupStep::RemoveImage,
            output,
            e,
        )),
    }
}

fn write_report(path: Option<&Path>, report: &BuildReport) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report).context("Failed to serialize build report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, json + "\n")
        .with_context(|| format!("Failed to write build report {}", path.display()))?;
    tracing::debug!(path = %path.display(), "build report written");
    Ok(())
}

fn print_summary(report: &BuildReport) {
    println!("\n=== Image Summary ===");
    println!("  Image:     {}", report.output.display());
    println!("  Size:      {} MiB", report.size_bytes / MIB);
    if let Some(allocated) = report.allocated_bytes {
        println!("  Allocated: {} MiB", allocated.div_ceil(MIB));
    }
    println!(
        "  Copied:    {} files, {} dirs, {} symlinks, {} special ({} bytes)",
        report.copied.files,
        report.copied.dirs,
        report.copied.symlinks,
        report.copied.special,
        report.copied.bytes
    );
    if report.copied.skipped > 0 {
        println!("  Skipped:   {} entries", report.copied.skipped);
    }
    for warning in &report.cleanup_warnings {
        eprintln!("[WARN] {}", warning);
    }
}
