//! Verify command - probes an image and optionally diffs it against a tree.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::Config;
use crate::host::Host;
use crate::image::{self, CancelFlag, FsKind, VerifyTarget};

/// Options for one `rootimg verify` invocation.
#[derive(Debug, Clone)]
pub struct VerifyArgs {
    pub image: PathBuf,
    pub fs_kind: Option<FsKind>,
    pub against: Option<PathBuf>,
}

/// Execute the verify command.
pub fn cmd_verify<H: Host>(
    host: &H,
    args: &VerifyArgs,
    config: &Config,
    cancel: &CancelFlag,
) -> Result<()> {
    let kind = args.fs_kind.unwrap_or(config.fs_kind);
    println!("=== Verifying {} ===", args.image.display());

    let target = VerifyTarget {
        image: &args.image,
        kind,
        against: args.against.as_deref(),
        mount_base: &config.mount_base,
        mount_prefix: &config.mount_prefix,
    };
    let report = image::verify_image(host, &target, cancel)?;

    println!("  [OK] {} filesystem", report.fs_type);
    for warning in &report.cleanup_warnings {
        eprintln!("[WARN] {}", warning);
    }

    let Some(source) = &report.compared_against else {
        return Ok(());
    };
    if report.is_clean() {
        println!("  [OK] contents match {}", source.display());
        return Ok(());
    }

    println!("  [FAIL] contents differ from {}:", source.display());
    for difference in &report.differences {
        println!("    {}", difference);
    }
    bail!(
        "{} difference(s) between {} and {}",
        report.differences.len(),
        args.image.display(),
        source.display()
    );
}
