//! Build environment checks (privilege, loop devices, output directory,
//! disk space).

use std::fs;
use std::path::Path;

use crate::image::{available_space, MIB};
use crate::privilege;

use super::types::CheckResult;

/// Device used to allocate free loop slots.
const LOOP_CONTROL: &str = "/dev/loop-control";

/// Check build environment for an image of `size_bytes` written into
/// `output_dir` and mounted under `mount_base`.
pub fn check_build_environment(
    output_dir: &Path,
    mount_base: &Path,
    size_bytes: u64,
) -> Vec<CheckResult> {
    let mut results = Vec::new();

    results.push(check_privilege(privilege::has_admin_privilege()));

    if Path::new(LOOP_CONTROL).exists() {
        results.push(CheckResult::pass(LOOP_CONTROL));
    } else {
        results.push(CheckResult::fail(
            LOOP_CONTROL,
            "Not found - load the loop module (modprobe loop) or pass it into the container",
        ));
    }

    results.push(check_writable("output dir writable", output_dir));
    results.push(check_writable("mount base writable", mount_base));
    results.push(check_free_space(output_dir, size_bytes));

    results
}

pub(crate) fn check_privilege(privileged: bool) -> CheckResult {
    if privileged {
        CheckResult::pass_with(
            "privilege",
            &format!("euid {}", privilege::effective_uid()),
        )
    } else {
        CheckResult::fail(
            "privilege",
            &format!(
                "euid {} without CAP_SYS_ADMIN - run with sudo",
                privilege::effective_uid()
            ),
        )
    }
}

/// Write and remove a probe file in `dir`. A missing directory is judged
/// by its nearest existing ancestor, since the build creates it.
pub(crate) fn check_writable(name: &str, dir: &Path) -> CheckResult {
    let Some(existing) = dir.ancestors().find(|p| p.is_dir()) else {
        return CheckResult::fail(name, &format!("No existing ancestor of {}", dir.display()));
    };

    let probe = existing.join(format!(".rootimg-preflight-{}", std::process::id()));
    match fs::write(&probe, "test") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            if existing == dir {
                CheckResult::pass_with(name, &dir.display().to_string())
            } else {
                CheckResult::pass_with(
                    name,
                    &format!("{} (will be created)", dir.display()),
                )
            }
        }
        Err(e) => CheckResult::fail(
            name,
            &format!("Cannot write to {}: {}", existing.display(), e),
        ),
    }
}

pub(crate) fn check_free_space(dir: &Path, size_bytes: u64) -> CheckResult {
    let Some(existing) = dir.ancestors().find(|p| p.is_dir()) else {
        return CheckResult::fail("disk space", &format!("{} does not exist", dir.display()));
    };
    match available_space(existing) {
        Ok(avail) if avail >= size_bytes => CheckResult::pass_with(
            "disk space",
            &format!("{} MiB free, image needs {} MiB", avail / MIB, size_bytes.div_ceil(MIB)),
        ),
        Ok(avail) => CheckResult::fail(
            "disk space",
            &format!("{} MiB free, image needs {} MiB", avail / MIB, size_bytes.div_ceil(MIB)),
        ),
        Err(e) => CheckResult::warn("disk space", &format!("statvfs failed: {}", e)),
    }
}
