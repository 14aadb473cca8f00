//! Host tool availability checks.

use crate::image::FsKind;
use crate::process;

use super::types::CheckResult;

/// Tools every ext4 build runs.
const REQUIRED_TOOLS: [(&str, &str, &str); 4] = [
    ("mkfs.ext4", "e2fsprogs", "Required to format ext4 images"),
    ("losetup", "util-linux", "Required to attach loop devices"),
    ("mount", "util-linux", "Required to mount the image"),
    ("umount", "util-linux", "Required to release the mount"),
];

/// Check host tools are installed. `mkfs.vfat` becomes required when the
/// configured filesystem is vfat.
pub fn check_host_tools(fs_kind: FsKind) -> Vec<CheckResult> {
    let mut results = Vec::new();

    for (tool, package, purpose) in REQUIRED_TOOLS {
        results.push(check_tool_exists(tool, package, purpose, true));
    }

    results.push(check_tool_exists(
        "blkid",
        "util-linux",
        "Required for `rootimg verify`",
        false,
    ));
    results.push(check_tool_exists(
        "mkfs.vfat",
        "dosfstools",
        "Required for vfat images",
        fs_kind == FsKind::Vfat,
    ));

    results
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn test_missing_optional_tool_is_warning() {
        let result = check_tool_exists("rootimg-no-such-tool", "nothing", "Testing", false);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.details.unwrap().contains("Install 'nothing'"));
    }

    #[test]
    fn test_missing_required_tool_is_failure() {
        let result = check_tool_exists("rootimg-no-such-tool", "nothing", "Testing", true);
        assert_eq!(result.status, CheckStatus::Fail);
    }

    #[test]
    fn test_vfat_makes_mkfs_vfat_required() {
        let ext4 = check_host_tools(FsKind::Ext4);
        let vfat = check_host_tools(FsKind::Vfat);
        assert_eq!(ext4.len(), 6);
        let mkfs_vfat = |r: &[CheckResult]| r.iter().find(|c| c.name == "mkfs.vfat").cloned().unwrap();
        if process::which("mkfs.vfat").is_none() {
            assert_eq!(mkfs_vfat(&ext4[..]).status, CheckStatus::Warn);
            assert_eq!(mkfs_vfat(&vfat[..]).status, CheckStatus::Fail);
        }
    }
}
