//! Resource reaper.
//!
//! The reaper is created before the first resource that needs releasing and
//! takes ownership of the loop device and mount session as soon as they
//! exist. Release runs exactly once, either through [`Reaper::reap`] or on
//! drop, in reverse acquisition order: unmount, detach, remove directory.
//! Release failures become [`CleanupWarning`]s so the original error stays
//! the reported one.

use std::path::Path;

use super::format::FsKind;
use super::loopdev::LoopDevice;
use super::mount::{MountPoint, MountSession};
use crate::error::{BuildError, CleanupWarning};
use crate::host::Host;

pub struct Reaper<'h, H: Host> {
    host: &'h H,
    device: Option<LoopDevice>,
    session: Option<MountSession>,
    /// Warnings raised while acquiring, handed out by `reap`.
    pending: Vec<CleanupWarning>,
    reaped: bool,
}

impl<'h, H: Host> Reaper<'h, H> {
    /// Register a reaper that owns nothing yet.
    pub fn register(host: &'h H) -> Self {
        tracing::debug!("reaper registered");
        Self {
            host,
            device: None,
            session: None,
            pending: Vec::new(),
            reaped: false,
        }
    }

    /// Attach `backing` and keep the device for release.
    ///
    /// A second attach in the same run is `ImproperUse`; the host is not
    /// touched in that case.
    pub fn attach(&mut self, backing: &Path) -> Result<&LoopDevice, BuildError> {
        self.ensure_live()?;
        if let Some(existing) = &self.device {
            return Err(BuildError::ImproperUse(format!(
                "{} is already attached for this run",
                existing.path().display()
            )));
        }
        let device = LoopDevice::attach(self.host, backing, &mut self.pending)?;
        Ok(self.device.insert(device))
    }

    /// Create a fresh mount point under `base` and keep it for release.
    pub fn create_mount_point(&mut self, base: &Path, prefix: &str) -> Result<&Path, BuildError> {
        self.ensure_live()?;
        if let Some(existing) = &self.session {
            return Err(BuildError::ImproperUse(format!(
                "mount point {} already exists for this run",
                existing.path().display()
            )));
        }
        let point = MountPoint::create(base, prefix).map_err(|e| BuildError::MountFailed {
            target: base.to_path_buf(),
            reason: format!("cannot create mount point: {}", e),
        })?;
        Ok(self.session.insert(MountSession::new(point)).path())
    }

    /// Mount the held device on the held mount point.
    pub fn mount(&mut self, kind: FsKind, read_only: bool) -> Result<&Path, BuildError> {
        self.ensure_live()?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| BuildError::ImproperUse("mount before attach".to_string()))?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BuildError::ImproperUse("mount before mount point".to_string()))?;
        session.mount(self.host, device, kind, read_only)?;
        Ok(session.path())
    }

    /// Root of the mounted filesystem, or `ImproperUse` when nothing is
    /// mounted.
    pub fn mounted_root(&self) -> Result<&Path, BuildError> {
        match &self.session {
            Some(session) if session.is_mounted() => Ok(session.path()),
            _ => Err(BuildError::ImproperUse(
                "filesystem is not mounted".to_string(),
            )),
        }
    }

    /// Release everything held. Later calls return no warnings and do
    /// nothing.
    pub fn reap(&mut self) -> Vec<CleanupWarning> {
        if self.reaped {
            return Vec::new();
        }
        self.reaped = true;

        let mut warnings = std::mem::take(&mut self.pending);

        if let Some(session) = self.session.as_mut() {
            if let Err(w) = session.unmount(self.host) {
                warnings.push(w);
            }
        }
        if let Some(device) = self.device.as_mut() {
            if let Err(w) = device.detach(self.host) {
                warnings.push(w);
            }
        }
        if let Some(session) = self.session.as_mut() {
            if let Err(w) = session.remove_dir() {
                warnings.push(w);
            }
        }

        if warnings.is_empty() {
            tracing::debug!("all resources released");
        } else {
            tracing::warn!(count = warnings.len(), "cleanup finished with warnings");
        }
        warnings
    }

    fn ensure_live(&self) -> Result<(), BuildError> {
        if self.reaped {
            return Err(BuildError::ImproperUse(
                "resource acquired after cleanup".to_string(),
            ));
        }
        Ok(())
    }
}

impl<H: Host> Drop for Reaper<'_, H> {
    fn drop(&mut self) {
        if !self.reaped {
            self.reap();
        }
    }
}
