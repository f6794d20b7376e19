//! Host environment checks (privileges, work root, FUSE).

use std::fs;
use std::path::Path;

use crate::config::Config;

use super::types::CheckResult;

/// Below this much free space in the work root, warn.
const LOW_SPACE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

pub fn check_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // Loop mounts, chown and label writes need root
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        results.push(CheckResult::pass("root privileges"));
    } else {
        results.push(CheckResult::fail(
            "root privileges",
            "Not running as root. Mounting and restoring ownership require root.",
        ));
    }

    results.push(check_work_root(&config.work_root));

    if Path::new("/dev/fuse").exists() {
        results.push(CheckResult::pass("/dev/fuse"));
    } else {
        results.push(CheckResult::warn(
            "/dev/fuse",
            "Missing - user-space mount fallback unavailable",
        ));
    }

    results
}

fn check_work_root(work_root: &Path) -> CheckResult {
    let name = "work root";
    if let Err(e) = fs::create_dir_all(work_root) {
        return CheckResult::fail(
            name,
            &format!("Cannot create {}: {}", work_root.display(), e),
        );
    }

    let probe = work_root.join(".preflight-test");
    if let Err(e) = fs::write(&probe, "test") {
        return CheckResult::fail(
            name,
            &format!("Cannot write to {}: {}", work_root.display(), e),
        );
    }
    let _ = fs::remove_file(&probe);

    match fs2::available_space(work_root) {
        Ok(free) if free < LOW_SPACE_BYTES => CheckResult::warn(
            name,
            &format!(
                "{} has only {} MB free",
                work_root.display(),
                free / 1024 / 1024
            ),
        ),
        Ok(free) => CheckResult::pass_with(
            name,
            &format!("{} ({} MB free)", work_root.display(), free / 1024 / 1024),
        ),
        Err(e) => CheckResult::warn(name, &format!("Cannot query free space: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::types::CheckStatus;

    #[test]
    fn writable_work_root_is_created() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path().join("work");
        let result = check_work_root(&root);
        assert_ne!(result.status, CheckStatus::Fail);
        assert!(root.is_dir());
        assert!(!root.join(".preflight-test").exists());
    }
}
