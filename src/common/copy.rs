//! Bulk tree copy with progress.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::process::{self, Cmd, CommandResult};

/// `cp -a src/. dest/`, printing growth of `dest` while it runs.
///
/// A non-zero exit is returned, not raised; callers decide whether the
/// stderr means "out of space" or something fatal.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<CommandResult> {
    let total = process::tree_size(src).max(1);
    let result = Cmd::new("cp")
        .arg("-a")
        .arg(format!("{}/.", src.display()))
        .arg(format!("{}/", dest.display()))
        .allow_fail()
        .run_watched(dest, |copied| {
            print!(
                "\r  {} / {} MB ({}%)",
                copied / 1024 / 1024,
                total / 1024 / 1024,
                (copied.min(total) * 100) / total
            );
            let _ = std::io::stdout().flush();
        });
    println!();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn copies_files_and_links() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("dest");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(&dest).unwrap();
        fs::write(src.join("etc/fstab"), "none").unwrap();
        std::os::unix::fs::symlink("etc/fstab", src.join("fstab")).unwrap();

        let result = copy_tree(&src, &dest).unwrap();
        assert!(result.success());
        assert_eq!(fs::read_to_string(dest.join("etc/fstab")).unwrap(), "none");
        assert!(fs::symlink_metadata(dest.join("fstab"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn failure_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        let result = copy_tree(&temp.path().join("missing"), temp.path()).unwrap();
        assert!(!result.success());
        assert!(!result.stderr.is_empty());
    }
}
