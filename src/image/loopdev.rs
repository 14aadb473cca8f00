//! Loop attachment manager.

use std::path::{Path, PathBuf};

use crate::error::{BuildError, CleanupStep, CleanupWarning};
use crate::host::Host;

/// A loop device bound to one backing file.
#[derive(Debug)]
pub struct LoopDevice {
    device: PathBuf,
    attached: bool,
}

impl LoopDevice {
    /// Bind `backing` to a free loop slot.
    ///
    /// Either a usable device is returned or `AttachFailed`; a device path
    /// that does not look like a block device node is detached again before
    /// the error is returned. A failed rollback lands in `warnings`.
    pub fn attach<H: Host>(
        host: &H,
        backing: &Path,
        warnings: &mut Vec<CleanupWarning>,
    ) -> Result<Self, BuildError> {
        let device = host.attach(backing).map_err(|e| BuildError::AttachFailed {
            path: backing.to_path_buf(),
            reason: format!("{:#}", e),
        })?;

        if !device.starts_with("/dev") {
            if let Err(e) = host.detach(&device) {
                warnings.push(CleanupWarning::new(
                    CleanupStep::Detach,
                    &device,
                    format!("{:#}", e),
                ));
            }
            return Err(BuildError::AttachFailed {
                path: backing.to_path_buf(),
                reason: format!("unexpected device path '{}'", device.display()),
            });
        }

        tracing::info!(
            device = %device.display(),
            backing = %backing.display(),
            "loop device attached"
        );
        Ok(Self {
            device,
            attached: true,
        })
    }

    /// Device node, e.g. `/dev/loop3`.
    pub fn path(&self) -> &Path {
        &self.device
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Release the binding. Calling this on a released device is a no-op.
    ///
    /// A failed detach keeps the device marked attached and comes back as a
    /// warning; it is never escalated.
    pub fn detach<H: Host>(&mut self, host: &H) -> Result<(), CleanupWarning> {
        if !self.attached {
            return Ok(());
        }
        match host.detach(&self.device) {
            Ok(()) => {
                self.attached = false;
                tracing::info!(device = %self.device.display(), "loop device detached");
                Ok(())
            }
            Err(e) => Err(CleanupWarning::new(
                CleanupStep::Detach,
                &self.device,
                format!("{:#}", e),
            )),
        }
    }
}
