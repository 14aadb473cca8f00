//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `build` - Build a filesystem image from a directory tree
//! - `verify` - Probe an image and diff it against a tree
//! - `preflight` - Run preflight checks
//! - `show` - Display information

pub mod build;
mod preflight;
pub mod show;
pub mod verify;

pub use build::cmd_build;
pub use preflight::cmd_preflight;
pub use show::cmd_show;
pub use verify::cmd_verify;
