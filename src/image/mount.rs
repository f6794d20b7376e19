//! Mounting images as scope-bound resources.
//!
//! The kernel path is tried first because only it reliably exposes security
//! labels. When it fails, ext4 falls back to `fuse2fs` and EROFS to
//! `erofsfuse`; F2FS has no user-space driver. The returned [`MountGuard`]
//! unmounts on drop, so every exit path releases the mount point.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use super::{FsType, MountMethod};
use crate::config::Config;
use crate::error::RepackError;
use crate::process::{self, Cmd};

/// Read-only or read-write mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    fn as_opt(&self) -> &'static str {
        match self {
            Access::ReadOnly => "ro",
            Access::ReadWrite => "rw",
        }
    }
}

/// Mount helper configured from [`Config`].
pub struct Mounter {
    label_option: String,
}

impl Mounter {
    pub fn new(config: &Config) -> Self {
        Self {
            label_option: config.kernel_label_option.clone(),
        }
    }

    /// Mount `image` on `mountpoint`, kernel first, user-space second.
    pub fn mount(
        &self,
        image: &Path,
        fs_type: FsType,
        mountpoint: &Path,
        access: Access,
    ) -> Result<MountGuard> {
        fs::create_dir_all(mountpoint)?;

        let kernel_err = match self.mount_kernel(image, fs_type, mountpoint, access) {
            Ok(()) => {
                println!("  Mounted {} via kernel loop device", image.display());
                return Ok(MountGuard::new(mountpoint, MountMethod::Kernel));
            }
            Err(e) => format!("{:#}", e),
        };
        tracing::debug!("kernel mount failed: {}", kernel_err);

        let userspace_err = match mount_userspace(image, fs_type, mountpoint, access) {
            Ok(()) => {
                tracing::warn!(
                    "{} mounted through the user-space driver; security labels may be incomplete",
                    image.display()
                );
                println!("  Mounted {} via user-space driver", image.display());
                return Ok(MountGuard::new(mountpoint, MountMethod::Userspace));
            }
            Err(e) => format!("{:#}", e),
        };

        Err(RepackError::Unmountable {
            image: image.to_path_buf(),
            kernel: kernel_err,
            userspace: userspace_err,
        }
        .into())
    }

    fn mount_kernel(
        &self,
        image: &Path,
        fs_type: FsType,
        mountpoint: &Path,
        access: Access,
    ) -> Result<()> {
        let base = format!("loop,{}", access.as_opt());
        let mut attempts = Vec::new();
        if !self.label_option.is_empty() {
            attempts.push(format!("{},{}", base, self.label_option));
        }
        attempts.push(base);

        let mut last = None;
        for options in attempts {
            let result = Cmd::new("mount")
                .args(["-t", fs_type.as_str(), "-o", &options])
                .arg_path(image)
                .arg_path(mountpoint)
                .error_msg(format!("mount -o {} failed", options))
                .run();
            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!("{:#}", e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| anyhow::anyhow!("no mount attempt made")))
    }
}

fn mount_userspace(image: &Path, fs_type: FsType, mountpoint: &Path, access: Access) -> Result<()> {
    match fs_type {
        FsType::Ext4 => {
            process::require_tools(&[("fuse2fs", "e2fsprogs / fuse2fs")])?;
            Cmd::new("fuse2fs")
                .arg_path(image)
                .arg_path(mountpoint)
                .args(["-o", &format!("{},fakeroot", access.as_opt())])
                .error_msg("fuse2fs mount failed")
                .run()?;
        }
        FsType::Erofs => {
            if access == Access::ReadWrite {
                anyhow::bail!("EROFS is read-only; no writable user-space mount exists");
            }
            process::require_tools(&[("erofsfuse", "erofs-utils / erofsfuse")])?;
            Cmd::new("erofsfuse")
                .arg_path(image)
                .arg_path(mountpoint)
                .error_msg("erofsfuse mount failed")
                .run()?;
        }
        FsType::F2fs => anyhow::bail!("F2FS has no user-space mount driver"),
    }
    Ok(())
}

/// An active mount. Dropping it unmounts.
#[derive(Debug)]
pub struct MountGuard {
    mountpoint: PathBuf,
    method: MountMethod,
    active: bool,
}

impl MountGuard {
    fn new(mountpoint: &Path, method: MountMethod) -> Self {
        Self {
            mountpoint: mountpoint.to_path_buf(),
            method,
            active: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.mountpoint
    }

    pub fn method(&self) -> MountMethod {
        self.method
    }

    /// Unmount now, surfacing failure.
    pub fn unmount(mut self) -> Result<()> {
        self.active = false;
        unmount_path(&self.mountpoint, self.method)
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(e) = unmount_path(&self.mountpoint, self.method) {
            tracing::warn!("cleanup unmount of {} failed: {:#}", self.mountpoint.display(), e);
        }
    }
}

fn unmount_path(mountpoint: &Path, method: MountMethod) -> Result<()> {
    let _ = Cmd::new("sync").allow_fail().run();

    let plain = Cmd::new("umount").arg_path(mountpoint).allow_fail().run()?;
    if plain.success() {
        return Ok(());
    }

    if method == MountMethod::Userspace && process::exists("fusermount") {
        let fuse = Cmd::new("fusermount")
            .arg("-u")
            .arg_path(mountpoint)
            .allow_fail()
            .run()?;
        if fuse.success() {
            return Ok(());
        }
    }

    tracing::warn!(
        "umount {} failed ({}), detaching lazily",
        mountpoint.display(),
        plain.stderr_trimmed()
    );
    Cmd::new("umount")
        .arg("-l")
        .arg_path(mountpoint)
        .error_msg(format!("Could not unmount {}", mountpoint.display()))
        .run()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_options() {
        assert_eq!(Access::ReadOnly.as_opt(), "ro");
        assert_eq!(Access::ReadWrite.as_opt(), "rw");
    }

    #[test]
    fn f2fs_has_no_userspace_fallback() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = mount_userspace(
            &temp.path().join("x.img"),
            FsType::F2fs,
            temp.path(),
            Access::ReadOnly,
        )
        .unwrap_err();
        assert!(err.to_string().contains("F2FS"));
    }

    #[test]
    fn erofs_cannot_mount_writable() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = mount_userspace(
            &temp.path().join("x.img"),
            FsType::Erofs,
            temp.path(),
            Access::ReadWrite,
        )
        .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
