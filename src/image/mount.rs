//! Mount session: a uniquely named temporary directory plus the
//! {unmounted, mounted} state machine around it.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::format::FsKind;
use super::loopdev::LoopDevice;
use crate::error::{BuildError, CleanupStep, CleanupWarning};
use crate::host::Host;

/// Ephemeral directory a device gets mounted on.
#[derive(Debug)]
pub struct MountPoint {
    path: PathBuf,
    removed: bool,
}

impl MountPoint {
    /// Create a fresh, empty, mode 0700 directory under `base`.
    ///
    /// The directory outlives the `TempDir` handle; release goes through
    /// [`MountPoint::remove`], which never recurses into a mount.
    pub fn create(base: &Path, prefix: &str) -> io::Result<Self> {
        fs::create_dir_all(base)?;
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .permissions(fs::Permissions::from_mode(0o700))
            .tempdir_in(base)?
            .keep();
        tracing::debug!(path = %path.display(), "mount point created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the (empty) directory. Never recursive, so a directory that
    /// still has a filesystem mounted on it is left alone.
    pub fn remove(&mut self) -> Result<(), CleanupWarning> {
        if self.removed {
            return Ok(());
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CleanupWarning::new(CleanupStep::RemoveMountDir, &self.path, e)),
        }
        self.removed = true;
        tracing::debug!(path = %self.path.display(), "mount point removed");
        Ok(())
    }
}

/// Whether a session currently has a filesystem mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted,
}

/// A mount point and what is mounted on it.
#[derive(Debug)]
pub struct MountSession {
    point: MountPoint,
    state: MountState,
}

impl MountSession {
    pub fn new(point: MountPoint) -> Self {
        Self {
            point,
            state: MountState::Unmounted,
        }
    }

    pub fn path(&self) -> &Path {
        self.point.path()
    }

    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    /// Mount `device` on this session's directory.
    pub fn mount<H: Host>(
        &mut self,
        host: &H,
        device: &LoopDevice,
        kind: FsKind,
        read_only: bool,
    ) -> Result<(), BuildError> {
        if self.is_mounted() {
            return Err(BuildError::ImproperUse(format!(
                "{} is already mounted",
                self.path().display()
            )));
        }
        if !device.is_attached() {
            return Err(BuildError::ImproperUse(format!(
                "{} is not attached",
                device.path().display()
            )));
        }
        check_target(self.path())?;

        host.mount(device.path(), self.path(), kind, read_only)
            .map_err(|e| BuildError::MountFailed {
                target: self.path().to_path_buf(),
                reason: format!("{:#}", e),
            })?;

        self.state = MountState::Mounted;
        tracing::info!(
            device = %device.path().display(),
            mount_point = %self.path().display(),
            read_only,
            "mounted"
        );
        Ok(())
    }

    /// Unmount if mounted. A failure leaves the session mounted.
    pub fn unmount<H: Host>(&mut self, host: &H) -> Result<(), CleanupWarning> {
        if !self.is_mounted() {
            return Ok(());
        }
        match host.unmount(self.path()) {
            Ok(()) => {
                self.state = MountState::Unmounted;
                tracing::info!(mount_point = %self.path().display(), "unmounted");
                Ok(())
            }
            Err(e) => Err(CleanupWarning::new(
                CleanupStep::Unmount,
                self.path(),
                format!("{:#}; try 'umount -l {}'", e, self.path().display()),
            )),
        }
    }

    /// Remove the mount directory.
    pub fn remove_dir(&mut self) -> Result<(), CleanupWarning> {
        self.point.remove()
    }
}

/// The target must be an existing, empty, writable directory.
fn check_target(target: &Path) -> Result<(), BuildError> {
    let fail = |reason: String| BuildError::MountFailed {
        target: target.to_path_buf(),
        reason,
    };

    let meta = fs::metadata(target).map_err(|e| fail(format!("mount point unusable: {}", e)))?;
    if !meta.is_dir() {
        return Err(fail("mount point is not a directory".to_string()));
    }
    let mut entries =
        fs::read_dir(target).map_err(|e| fail(format!("cannot read mount point: {}", e)))?;
    if entries.next().is_some() {
        return Err(fail("mount point is not empty".to_string()));
    }
    if !is_writable(target) {
        return Err(fail("mount point is not writable".to_string()));
    }
    Ok(())
}

fn is_writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}
