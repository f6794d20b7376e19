//! Host tool availability checks, grouped by the operation that needs them.

use crate::process;

use super::types::CheckResult;

/// (tool, package, purpose)
type ToolSpec = (&'static str, &'static str, &'static str);

pub const UNPACK_REQUIRED: &[ToolSpec] = &[
    ("mount", "util-linux", "Loop-mounts source images"),
    ("umount", "util-linux", "Releases mounts"),
    ("cp", "coreutils", "Copies the mounted tree"),
];

pub const UNPACK_OPTIONAL: &[ToolSpec] = &[
    ("blkid", "util-linux", "Filesystem detection (signatures are used otherwise)"),
    ("getfattr", "attr", "Second label lookup strategy"),
    ("stat", "coreutils", "Third label lookup strategy"),
    ("fuse2fs", "fuse2fs", "User-space ext4 mount fallback"),
    ("erofsfuse", "erofs-utils", "User-space EROFS mount fallback"),
    ("fusermount", "fuse", "Unmounting user-space mounts"),
    ("dump.erofs", "erofs-utils", "Reads EROFS UUID and label"),
    ("getenforce", "selinux-utils", "SELinux enforcement handling"),
];

pub const EXT4_REQUIRED: &[ToolSpec] = &[
    ("mke2fs", "e2fsprogs", "Creates ext4 images"),
    ("e2fsck", "e2fsprogs", "Consistency check and block unsharing"),
    ("resize2fs", "e2fsprogs", "Grows and shrinks images"),
    ("dumpe2fs", "e2fsprogs", "Reads ext4 geometry and features"),
];

pub const EROFS_REQUIRED: &[ToolSpec] = &[("mkfs.erofs", "erofs-utils", "Creates EROFS images")];

pub const SPARSE_REQUIRED: &[ToolSpec] = &[
    ("simg2img", "android-sdk-libsparse-utils", "Expands sparse inputs"),
    ("img2simg", "android-sdk-libsparse-utils", "Writes sparse outputs"),
];

/// Check every tool in `tools`; missing ones fail if `required`, else warn.
pub fn check_tools(tools: &[ToolSpec], required: bool) -> Vec<CheckResult> {
    tools
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, required))
        .collect()
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path),
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
