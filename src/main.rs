//! rootimg - builds fixed-size filesystem images from a directory tree.
//!
//! Allocates a backing file, formats it, attaches it to a loop device,
//! mounts it and mirrors the source tree into it. Loop devices, mounts and
//! mount directories are always released, including on Ctrl-C.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rootimg::commands::{self, build::BuildArgs, show::ShowTarget, verify::VerifyArgs};
use rootimg::config::Config;
use rootimg::{BuildError, CancelFlag, FsKind, SystemHost};

#[derive(Parser)]
#[command(name = "rootimg")]
#[command(about = "Filesystem image builder")]
#[command(
    after_help = "QUICK START:\n  rootimg preflight                    Check tools and privilege\n  sudo rootimg build rootfs/ out.img   Build an ext4 image\n  sudo rootimg verify out.img --against rootfs/"
)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a directory tree (requires root)
    Build {
        /// Directory whose contents become the image root
        source: PathBuf,
        /// Image file to create (overwritten if present)
        output: PathBuf,
        /// Image size in MiB (default: ROOTIMG_SIZE_MB or 512)
        #[arg(short, long)]
        size: Option<u64>,
        /// Filesystem type (default: ROOTIMG_FS_TYPE or ext4)
        #[arg(long = "fs", value_enum)]
        fs_kind: Option<FsKind>,
        /// Volume label
        #[arg(short = 'L', long)]
        label: Option<String>,
        /// Delete the image if the build fails
        #[arg(long)]
        remove_on_failure: bool,
        /// Write <output>.sha256 after a successful build
        #[arg(long)]
        checksum: bool,
        /// Write a JSON build report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Check an image's filesystem and optionally compare it to a tree
    Verify {
        /// Image file to check
        image: PathBuf,
        /// Expected filesystem type (default: ROOTIMG_FS_TYPE or ext4)
        #[arg(long = "fs", value_enum)]
        fs_kind: Option<FsKind>,
        /// Mount read-only and diff against this directory (requires root)
        #[arg(long)]
        against: Option<PathBuf>,
    },

    /// Run preflight checks (tools, privilege, loop devices, disk space)
    Preflight {
        /// Directory the image will be written to
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowWhat,
    },
}

#[derive(Subcommand)]
enum ShowWhat {
    /// Show effective configuration
    Config,
    /// Show external tool locations
    Tools,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<BuildError>()
                .map(BuildError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    match cli.command {
        Commands::Build {
            source,
            output,
            size,
            fs_kind,
            label,
            remove_on_failure,
            checksum,
            report,
        } => {
            let cancel = CancelFlag::install_signal_handler()?;
            let args = BuildArgs {
                source,
                output,
                size_mb: size,
                fs_kind,
                label,
                remove_on_failure,
                checksum,
                report,
            };
            commands::cmd_build(&SystemHost, &args, &config, &cancel)?;
        }

        Commands::Verify {
            image,
            fs_kind,
            against,
        } => {
            let cancel = CancelFlag::install_signal_handler()?;
            let args = VerifyArgs {
                image,
                fs_kind,
                against,
            };
            commands::cmd_verify(&SystemHost, &args, &config, &cancel)?;
        }

        Commands::Preflight { output_dir, strict } => {
            commands::cmd_preflight(&config, &output_dir, strict)?;
        }

        Commands::Show { what } => {
            let target = match what {
                ShowWhat::Config => ShowTarget::Config,
                ShowWhat::Tools => ShowTarget::Tools,
            };
            commands::cmd_show(target, &config)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().compact().with_target(false).with_writer(std::io::stderr)),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}
