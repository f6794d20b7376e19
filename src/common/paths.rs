//! Conversions between on-disk paths and image-absolute ledger keys.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

/// Image-absolute key (`/`, `/system/bin/sh`) for `path` below `root`.
pub fn image_path(root: &Path, path: &Path) -> Result<String> {
    let rel = match path.strip_prefix(root) {
        Ok(rel) => rel,
        Err(_) => bail!(
            "{} is not inside {}",
            path.display(),
            root.display()
        ),
    };

    let mut key = String::from("/");
    for (i, component) in rel.components().enumerate() {
        match component {
            Component::Normal(name) => {
                if i > 0 {
                    key.push('/');
                }
                key.push_str(&name.to_string_lossy());
            }
            Component::CurDir => {}
            other => bail!("unexpected path component {:?} in {}", other, path.display()),
        }
    }
    Ok(key)
}

/// Parent key of an image path, or `None` for the root.
pub fn parent_key(key: &str) -> Option<&str> {
    if key == "/" {
        return None;
    }
    match key.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&key[..idx]),
        None => Some("/"),
    }
}

/// Ancestors of `key`, nearest first, ending with `/`. Excludes `key` itself.
pub fn ancestors(key: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_key(key), |k| parent_key(*k))
}

/// File name without the last extension (`system.img` -> `system`).
pub fn image_stem(image: &Path) -> String {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

/// Default extraction directory for an image: `./<stem>`.
pub fn default_destination(image: &Path) -> PathBuf {
    PathBuf::from(image_stem(image))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_key() {
        let root = Path::new("/mnt/x");
        assert_eq!(image_path(root, root).unwrap(), "/");
    }

    #[test]
    fn nested_key() {
        let root = Path::new("/mnt/x");
        assert_eq!(
            image_path(root, Path::new("/mnt/x/lib/modules/a.ko")).unwrap(),
            "/lib/modules/a.ko"
        );
    }

    #[test]
    fn outside_root_is_error() {
        assert!(image_path(Path::new("/mnt/x"), Path::new("/etc")).is_err());
    }

    #[test]
    fn ancestor_chain_ends_at_root() {
        let chain: Vec<&str> = ancestors("/lib/modules/a.ko").collect();
        assert_eq!(chain, vec!["/lib/modules", "/lib", "/"]);
        assert_eq!(ancestors("/").count(), 0);
        assert_eq!(ancestors("/top").collect::<Vec<_>>(), vec!["/"]);
    }

    #[test]
    fn stems() {
        assert_eq!(image_stem(Path::new("/a/system.img")), "system");
        assert_eq!(default_destination(Path::new("vendor.ext4.img")), PathBuf::from("vendor.ext4"));
    }
}
