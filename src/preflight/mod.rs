//! Preflight checks for image builds.
//!
//! Validates host tools, privilege and the output location before a build.
//! Run with `rootimg preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use std::path::Path;

use anyhow::{bail, Result};

use crate::config::Config;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks for building into `output_dir`.
pub fn run_preflight(config: &Config, output_dir: &Path) -> PreflightReport {
    let mut checks = Vec::new();

    println!("Running preflight checks...\n");

    println!("Checking host tools...");
    checks.extend(host_tools::check_host_tools(config.fs_kind));

    println!("Checking build environment...");
    checks.extend(environment::check_build_environment(
        output_dir,
        &config.mount_base,
        config.size_bytes(),
    ));

    println!();

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &Config, output_dir: &Path) -> Result<()> {
    let report = run_preflight(config, output_dir);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above before building.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
