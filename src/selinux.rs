//! SELinux enforcement as a scoped resource, plus label xattr access.
//!
//! Mounting with labels and writing `security.selinux` on a host that
//! enforces its own policy fails in confusing ways, so the pipelines hold an
//! [`EnforcementGuard`] for their whole duration. The previous mode comes
//! back when the guard drops, on success, error or interruption alike.

use anyhow::{Context, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::process::{self, Cmd};

/// Extended attribute holding the MAC label.
pub const LABEL_XATTR: &str = "security.selinux";

/// Host enforcement mode as reported by `getenforce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Enforcing,
    Permissive,
    Disabled,
}

impl Enforcement {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "enforcing" => Some(Self::Enforcing),
            "permissive" => Some(Self::Permissive),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Saves the enforcement mode, switches to permissive, restores on drop.
#[derive(Debug)]
pub struct EnforcementGuard {
    restore: Option<Enforcement>,
}

impl EnforcementGuard {
    /// Acquire the guard. Hosts without SELinux tooling get a no-op guard.
    pub fn acquire() -> Result<Self> {
        if !process::exists("getenforce") {
            tracing::debug!("getenforce not found, leaving MAC enforcement alone");
            return Ok(Self { restore: None });
        }

        let current = Cmd::new("getenforce").run()?;
        match Enforcement::parse(current.stdout_trimmed()) {
            Some(Enforcement::Enforcing) => {
                Cmd::new("setenforce")
                    .arg("0")
                    .error_msg("Could not switch SELinux to permissive")
                    .run()?;
                tracing::info!("SELinux set permissive for the duration of this run");
                Ok(Self {
                    restore: Some(Enforcement::Enforcing),
                })
            }
            _ => Ok(Self { restore: None }),
        }
    }
}

impl Drop for EnforcementGuard {
    fn drop(&mut self) {
        if let Some(Enforcement::Enforcing) = self.restore.take() {
            match Cmd::new("setenforce").arg("1").run() {
                Ok(_) => tracing::info!("SELinux enforcement restored"),
                Err(e) => tracing::warn!("could not restore SELinux enforcement: {:#}", e),
            }
        }
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL byte: {}", path.display()))
}

/// Read the label xattr without following symlinks.
///
/// `Ok(None)` when the attribute is absent or unsupported.
pub fn read_label_xattr(path: &Path) -> Result<Option<String>> {
    let c_path = c_path(path)?;
    let c_name = CString::new(LABEL_XATTR)?;

    let size = unsafe { libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::ENOTSUP) => Ok(None),
            _ => Err(err).with_context(|| format!("lgetxattr failed for {}", path.display())),
        };
    }
    if size == 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; size as usize];
    let size = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if size < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("lgetxattr failed for {}", path.display()));
    }
    buf.truncate(size as usize);

    // Kernel-stored contexts carry a trailing NUL.
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write the label xattr without following symlinks.
pub fn write_label_xattr(path: &Path, label: &str) -> Result<()> {
    let c_path = c_path(path)?;
    let c_name = CString::new(LABEL_XATTR)?;
    let value = CString::new(label).context("label contains NUL byte")?;
    let bytes = value.as_bytes_with_nul();

    let ret = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            0,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("lsetxattr {} failed for {}", LABEL_XATTR, path.display()));
    }
    Ok(())
}

/// Remove the label xattr without following symlinks.
///
/// Returns whether a label was present. Hosts or filesystems without
/// label support report `Ok(false)`.
pub fn remove_label_xattr(path: &Path) -> Result<bool> {
    let c_path = c_path(path)?;
    let c_name = CString::new(LABEL_XATTR)?;

    let ret = unsafe { libc::lremovexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENODATA) | Some(libc::ENOTSUP) => Ok(false),
            _ => Err(err)
                .with_context(|| format!("lremovexattr {} failed for {}", LABEL_XATTR, path.display())),
        };
    }
    Ok(true)
}
