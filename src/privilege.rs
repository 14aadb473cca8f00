//! Privilege guard.
//!
//! Loop devices and mounts need either root or `CAP_SYS_ADMIN` in the
//! effective capability set. The guard only inspects; it never escalates.

use std::fs;

use crate::error::BuildError;
use crate::host::Host;

/// Capability number of `CAP_SYS_ADMIN`.
pub const CAP_SYS_ADMIN: u32 = 21;

/// Effective user id of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Parse the `CapEff:` mask out of `/proc/self/status` contents.
pub fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// Whether a capability mask contains `CAP_SYS_ADMIN`.
pub fn has_cap_sys_admin(mask: u64) -> bool {
    mask & (1 << CAP_SYS_ADMIN) != 0
}

/// Whether the running process may attach loop devices and mount.
pub fn has_admin_privilege() -> bool {
    if effective_uid() == 0 {
        return true;
    }
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_cap_eff(&status))
        .is_some_and(has_cap_sys_admin)
}

/// Fail fast with `PermissionDenied` unless the host grants privilege.
pub fn ensure_privileged<H: Host>(host: &H) -> Result<(), BuildError> {
    if host.has_admin_privilege() {
        tracing::debug!(euid = effective_uid(), "privilege check passed");
        return Ok(());
    }
    Err(BuildError::PermissionDenied(format!(
        "loop devices and mounts require root or CAP_SYS_ADMIN (euid={}); \
         run with sudo or inside a privileged container",
        effective_uid()
    )))
}
