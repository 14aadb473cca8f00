//! rootimg library exports.
//!
//! The binary is a thin clap front end over these modules; integration
//! tests drive the pipeline through [`host::Host`] fakes.

pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod image;
pub mod preflight;
pub mod privilege;
pub mod process;
pub mod timing;

pub use error::{BuildError, CleanupStep, CleanupWarning};
pub use host::{Host, SystemHost};
pub use image::{build_image, run_build, BuildReport, CancelFlag, FsKind, ImageSpec, Stage};
