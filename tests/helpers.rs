//! Shared test utilities for repackfs tests.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use repackfs::config::Config;
use repackfs::ledger::{AttributeRecord, Ledgers, Sidecar};

/// Test environment with an extracted-tree directory and a work root.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Extracted tree (what `unpack` would produce)
    pub tree: PathBuf,
    /// Scratch root handed to the pipelines
    pub work_root: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = temp_dir.path().join("system");
        let work_root = temp_dir.path().join("work");
        fs::create_dir_all(&tree).expect("Failed to create tree dir");
        fs::create_dir_all(&work_root).expect("Failed to create work root");

        Self {
            _temp_dir: temp_dir,
            tree,
            work_root,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            work_root: self.work_root.clone(),
            ..Config::default()
        }
    }

    pub fn sidecar(&self) -> Sidecar {
        Sidecar::for_tree(&self.tree)
    }
}

/// uid/gid of the test process, so ownership can be applied without root.
pub fn current_ids() -> (u32, u32) {
    unsafe { (libc::getuid(), libc::getgid()) }
}

/// A small system-partition-like tree.
pub fn create_mock_tree(root: &Path) {
    for dir in ["bin", "etc/init", "lib/modules", "app/Settings"] {
        fs::create_dir_all(root.join(dir)).expect("Failed to create mock dir");
    }

    write_file(root, "bin/sh", "#!/bin/sh\n", 0o755);
    write_file(root, "etc/hosts", "127.0.0.1 localhost\n", 0o644);
    write_file(root, "etc/init/boot.rc", "on boot\n", 0o640);
    write_file(root, "lib/modules/wifi.ko", "\x7fELF", 0o644);
    write_file(root, "app/Settings/Settings.apk", "PK", 0o644);
    write_file(root, "build.prop", "ro.build.id=TEST\n", 0o600);

    std::os::unix::fs::symlink("/system/bin/sh", root.join("bin/toolbox"))
        .expect("Failed to create symlink");
}

pub fn write_file(root: &Path, rel: &str, content: &str, mode: u32) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(&path, content).expect("Failed to write file");
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("Failed to chmod");
}

/// Ledgers with every recorded path owned by the current user.
pub fn owned_ledgers(entries: &[(&str, u32)]) -> Ledgers {
    let (uid, gid) = current_ids();
    let mut ledgers = Ledgers::default();
    for (path, mode) in entries {
        ledgers
            .attributes
            .insert(*path, AttributeRecord::new(uid, gid, *mode));
    }
    ledgers
}

/// Permission bits of `path` (no type bits).
pub fn mode_of(path: &Path) -> u32 {
    fs::symlink_metadata(path)
        .expect("Failed to stat")
        .permissions()
        .mode()
        & 0o7777
}

pub fn assert_mode(path: &Path, expected: u32) {
    let actual = mode_of(path);
    assert_eq!(
        actual,
        expected,
        "{}: expected mode {:04o}, found {:04o}",
        path.display(),
        expected,
        actual
    );
}
