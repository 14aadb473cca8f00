//! Preflight command - runs preflight checks.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::preflight;

/// Execute the preflight command against the directory the image will be
/// written to.
pub fn cmd_preflight(config: &Config, output_dir: &Path, strict: bool) -> Result<()> {
    if strict {
        preflight::run_preflight_or_fail(config, output_dir)?;
    } else {
        let report = preflight::run_preflight(config, output_dir);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to fail with a non-zero exit code.");
        }
    }
    Ok(())
}
