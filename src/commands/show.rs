//! Show command - displays information.

use anyhow::Result;

use crate::config::Config;
use crate::process;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show effective configuration
    Config,
    /// Show which external tools were found
    Tools,
}

/// External tools the pipeline may run.
const TOOLS: [&str; 6] = ["mkfs.ext4", "mkfs.vfat", "losetup", "mount", "umount", "blkid"];

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Tools => {
            println!("Tools:");
            for tool in TOOLS {
                match process::which(tool) {
                    Some(path) => println!("  {}: {}", tool, path.display()),
                    None => println!("  {}: NOT FOUND", tool),
                }
            }
        }
    }
    Ok(())
}
