//! Kernel-facing primitives behind a trait.
//!
//! The pipeline only talks to the host through [`Host`]. [`SystemHost`]
//! drives the standard tools (mkfs, losetup, mount, umount, blkid); tests
//! substitute a recording fake so stage ordering and release pairing can be
//! checked without privilege.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

use crate::image::FsKind;
use crate::privilege;
use crate::process::Cmd;

/// Operations that need the host kernel.
pub trait Host {
    /// Whether the process may attach loop devices and mount filesystems.
    fn has_admin_privilege(&self) -> bool;

    /// Create a filesystem on `image`, overwriting any existing signature.
    fn format(&self, image: &Path, kind: FsKind, label: Option<&str>) -> Result<()>;

    /// Bind `image` to a free loop device and return the device path.
    fn attach(&self, image: &Path) -> Result<PathBuf>;

    /// Release a loop device binding.
    fn detach(&self, device: &Path) -> Result<()>;

    /// Mount `device` at `target`.
    fn mount(&self, device: &Path, target: &Path, kind: FsKind, read_only: bool) -> Result<()>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Filesystem type recorded in the image superblock, if any.
    fn probe_fs_type(&self, image: &Path) -> Result<Option<String>>;
}

/// [`Host`] backed by util-linux and e2fsprogs/dosfstools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn has_admin_privilege(&self) -> bool {
        privilege::has_admin_privilege()
    }

    fn format(&self, image: &Path, kind: FsKind, label: Option<&str>) -> Result<()> {
        kind.mkfs_command(image, label).run()?;
        Ok(())
    }

    fn attach(&self, image: &Path) -> Result<PathBuf> {
        // --find --show allocates and binds in one call, so a failure never
        // leaves a half-bound slot behind.
        let result = Cmd::new("losetup")
            .args(["--find", "--show"])
            .arg_path(image)
            .error_msg("losetup failed to attach image")
            .run()?;

        let device = result.stdout_trimmed();
        if device.is_empty() {
            bail!("losetup did not report a device for {}", image.display());
        }
        Ok(PathBuf::from(device))
    }

    fn detach(&self, device: &Path) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg_path(device)
            .error_msg("losetup failed to detach device")
            .run()?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, kind: FsKind, read_only: bool) -> Result<()> {
        let mut cmd = Cmd::new("mount").args(["-t", kind.as_str()]);
        if read_only {
            cmd = cmd.args(["-o", "ro"]);
        }
        cmd.arg_path(device)
            .arg_path(target)
            .error_msg("mount failed")
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg("umount failed")
            .run()?;
        Ok(())
    }

    fn probe_fs_type(&self, image: &Path) -> Result<Option<String>> {
        let result = Cmd::new("blkid")
            .args(["-p", "-o", "value", "-s", "TYPE"])
            .arg_path(image)
            .allow_fail()
            .run()?;

        // blkid exits 2 when no signature is found.
        match result.code() {
            0 => {
                let fs_type = result.stdout_trimmed();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_string()))
            }
            2 => Ok(None),
            code => bail!(
                "blkid failed on {} (exit code {}): {}",
                image.display(),
                code,
                result.stderr_trimmed()
            ),
        }
    }
}
