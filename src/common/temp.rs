//! Scope-bound scratch directories.
//!
//! Scratch directories hold mount points. Removal refuses to run while any
//! directory below is still a mount, so a failed unmount never turns into
//! deleting the mounted image's content.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Prepare a work directory, removing it if it exists and creating it fresh.
///
/// # Arguments
/// * `parent_dir` - Parent directory where the work dir should be created
/// * `name` - Name of the work directory (e.g., "system-scratch")
pub fn prepare_work_dir(parent_dir: &Path, name: &str) -> Result<PathBuf> {
    let work_dir = parent_dir.join(name);

    // Leftover from an interrupted run
    if work_dir.exists() {
        remove_unless_mounted(&work_dir)?;
    }

    fs::create_dir_all(&work_dir)
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;

    Ok(work_dir)
}

fn device_of(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|m| m.dev())
}

/// Directories below `dir` living on another filesystem, i.e. mount points.
pub fn mounts_below(dir: &Path) -> Result<Vec<PathBuf>> {
    foreign_dirs(dir, device_of)
}

fn foreign_dirs<D>(dir: &Path, dev_of: D) -> Result<Vec<PathBuf>>
where
    D: Fn(&Path) -> io::Result<u64>,
{
    let root_dev = dev_of(dir).with_context(|| format!("Failed to stat {}", dir.display()))?;
    let mut found = Vec::new();
    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(false).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("skipping unreadable scratch entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let dev = dev_of(entry.path())
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if dev != root_dev {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    Ok(found)
}

fn remove_unless_mounted(dir: &Path) -> Result<()> {
    remove_checked(dir, device_of)
}

fn remove_checked<D>(dir: &Path, dev_of: D) -> Result<()>
where
    D: Fn(&Path) -> io::Result<u64>,
{
    let mounts = foreign_dirs(dir, dev_of)?;
    if let Some(first) = mounts.first() {
        bail!(
            "Refusing to remove {}: {} is still mounted (unmount it first)",
            dir.display(),
            first.display()
        );
    }
    fs::remove_dir_all(dir).with_context(|| format!("Failed to clear {}", dir.display()))
}

/// A directory that is removed when the guard drops.
///
/// Drop never fails; removal errors, including a live mount underneath,
/// are logged and the directory is left in place.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create (or recreate) `parent/name` and take ownership of it.
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = prepare_work_dir(parent, name)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Join a child path inside the scratch directory.
    pub fn join(&self, child: impl AsRef<Path>) -> PathBuf {
        self.path.join(child)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = remove_unless_mounted(&self.path) {
            tracing::warn!("scratch {} left in place: {:#}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Pretends every directory named `mnt` is on another device.
    fn mnt_is_foreign(path: &Path) -> io::Result<u64> {
        let real = device_of(path)?;
        Ok(if path.file_name().is_some_and(|n| n == "mnt") {
            real + 1
        } else {
            real
        })
    }

    #[test]
    fn prepare_work_dir_clears_previous_content() {
        let temp = TempDir::new().unwrap();
        let first = prepare_work_dir(temp.path(), "work").unwrap();
        fs::write(first.join("stale"), "x").unwrap();

        let second = prepare_work_dir(temp.path(), "work").unwrap();
        assert_eq!(first, second);
        assert!(!second.join("stale").exists());
    }

    #[test]
    fn scratch_is_removed_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create(temp.path(), "scratch").unwrap();
            fs::write(scratch.join("file"), "data").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn plain_tree_has_no_mounts() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("mnt/system/bin")).unwrap();
        fs::write(temp.path().join("mnt/system/bin/sh"), "x").unwrap();
        assert!(mounts_below(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn live_mount_blocks_removal() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("repack-system");
        fs::create_dir_all(scratch.join("mnt/etc")).unwrap();
        fs::write(scratch.join("mnt/etc/hosts"), "image content").unwrap();

        let mounts = foreign_dirs(&scratch, mnt_is_foreign).unwrap();
        assert_eq!(mounts, vec![scratch.join("mnt")]);

        let err = remove_checked(&scratch, mnt_is_foreign).unwrap_err();
        assert!(err.to_string().contains("still mounted"));
        assert_eq!(
            fs::read_to_string(scratch.join("mnt/etc/hosts")).unwrap(),
            "image content"
        );
    }

    #[test]
    fn unmounted_scratch_is_removed() {
        let temp = TempDir::new().unwrap();
        let scratch = temp.path().join("unpack-vendor");
        fs::create_dir_all(scratch.join("tree")).unwrap();
        remove_checked(&scratch, device_of).unwrap();
        assert!(!scratch.exists());
    }
}
