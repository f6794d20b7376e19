//! Image-level concerns: type probing, sparse handling, mounting, ext4 geometry.
//!
//! - [`probe`] - Sparse and filesystem signature detection
//! - [`sparse`] - simg2img / img2simg wrappers
//! - [`mount`] - Kernel loop mount with user-space fallback, as a scope guard
//! - [`ext4info`] - `dumpe2fs -h` parsing into [`ext4info::Ext4Geometry`]

pub mod ext4info;
pub mod mount;
pub mod probe;
pub mod sparse;

use std::fmt;
use std::str::FromStr;

use crate::error::RepackError;

/// Filesystems the engine can unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Erofs,
    F2fs,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Erofs => "erofs",
            FsType::F2fs => "f2fs",
        }
    }

    /// Only ext4 and EROFS can be rebuilt.
    pub fn is_buildable(&self) -> bool {
        matches!(self, FsType::Ext4 | FsType::Erofs)
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = RepackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // mount -t ext4 handles the older revisions too
            "ext4" | "ext3" | "ext2" => Ok(FsType::Ext4),
            "erofs" => Ok(FsType::Erofs),
            "f2fs" => Ok(FsType::F2fs),
            other => Err(RepackError::UnsupportedFilesystem(other.to_string())),
        }
    }
}

/// How the source image ended up mounted during unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMethod {
    /// Privileged loop mount; labels visible.
    Kernel,
    /// FUSE driver; labels may be missing.
    Userspace,
}

impl MountMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMethod::Kernel => "kernel",
            MountMethod::Userspace => "userspace",
        }
    }
}

impl fmt::Display for MountMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MountMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "kernel" => Ok(MountMethod::Kernel),
            "userspace" => Ok(MountMethod::Userspace),
            other => anyhow::bail!("unknown mount method '{}'", other),
        }
    }
}
