//! Sparse image conversion (`simg2img` / `img2simg`).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::process::{self, Cmd};

pub const SPARSE_TOOLS: &[(&str, &str)] = &[
    ("simg2img", "android-sdk-libsparse-utils"),
    ("img2simg", "android-sdk-libsparse-utils"),
];

/// Expand a sparse image into `raw`. Failure is fatal for the caller.
pub fn to_raw(sparse: &Path, raw: &Path) -> Result<()> {
    println!("Converting sparse image to raw...");
    process::require_tools(&SPARSE_TOOLS[..1])?;

    Cmd::new("simg2img")
        .arg_path(sparse)
        .arg_path(raw)
        .error_msg(format!("simg2img could not expand {}", sparse.display()))
        .run()?;

    let size = fs::metadata(raw)
        .with_context(|| format!("simg2img produced no output at {}", raw.display()))?
        .len();
    println!("  Raw image: {} MB", size / 1024 / 1024);
    Ok(())
}

/// Outcome of [`package`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparseOutcome {
    Sparse,
    /// Conversion failed; the raw image was left in place.
    KeptRaw(String),
}

fn temp_path(image: &Path) -> PathBuf {
    let mut name = image
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".sparse.tmp");
    image.with_file_name(name)
}

/// Convert the finished raw `image` to sparse in place.
///
/// Never fails the build: on any problem the raw image is kept and a
/// warning is logged.
pub fn package(image: &Path) -> SparseOutcome {
    println!("Converting {} to sparse format...", image.display());
    let tmp = temp_path(image);

    let result = (|| -> Result<()> {
        process::require_tools(&SPARSE_TOOLS[1..])?;
        Cmd::new("img2simg")
            .arg_path(image)
            .arg_path(&tmp)
            .error_msg("img2simg failed")
            .run()?;
        fs::rename(&tmp, image)
            .with_context(|| format!("Failed to move sparse image over {}", image.display()))?;
        Ok(())
    })();

    match result {
        Ok(()) => SparseOutcome::Sparse,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            tracing::warn!("sparse conversion failed, keeping raw image: {:#}", e);
            SparseOutcome::KeptRaw(format!("{:#}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_sibling() {
        assert_eq!(
            temp_path(Path::new("/out/system.img")),
            PathBuf::from("/out/system.img.sparse.tmp")
        );
    }

    #[test]
    fn failed_conversion_keeps_raw() {
        let temp = tempfile::TempDir::new().unwrap();
        let image = temp.path().join("not-an-fs.img");
        fs::write(&image, b"raw bytes").unwrap();

        // Either img2simg is missing or it rejects/accepts the file; the raw
        // image must survive a failure and no temp file may be left.
        let outcome = package(&image);
        assert!(image.exists());
        assert!(!temp_path(&image).exists());
        if let SparseOutcome::KeptRaw(_) = outcome {
            assert_eq!(fs::read(&image).unwrap(), b"raw bytes");
        }
    }
}
