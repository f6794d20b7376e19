//! Signature probes for sparse encoding and filesystem type.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::FsType;
use crate::process::{self, Cmd};

/// Android sparse image header magic (little-endian at offset 0).
pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;

/// ext2/3/4 superblock magic, u16 at 1024 + 0x38.
const EXT4_MAGIC: u16 = 0xEF53;
const EXT4_MAGIC_OFFSET: u64 = 1080;

/// EROFS and F2FS superblock magics, u32 at 1024.
const EROFS_MAGIC: u32 = 0xE0F5_E1E2;
const F2FS_MAGIC: u32 = 0xF2F5_2010;
const SUPER_OFFSET: u64 = 1024;

fn read_at<const N: usize>(file: &mut File, offset: u64) -> Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// True if `image` carries the sparse header.
pub fn is_sparse(image: &Path) -> Result<bool> {
    let mut file =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;
    Ok(read_at::<4>(&mut file, 0)?
        .map(|b| u32::from_le_bytes(b) == SPARSE_MAGIC)
        .unwrap_or(false))
}

/// Match superblock signatures directly.
pub fn detect_by_signature(image: &Path) -> Result<Option<FsType>> {
    let mut file =
        File::open(image).with_context(|| format!("Failed to open {}", image.display()))?;

    if let Some(b) = read_at::<4>(&mut file, SUPER_OFFSET)? {
        match u32::from_le_bytes(b) {
            EROFS_MAGIC => return Ok(Some(FsType::Erofs)),
            F2FS_MAGIC => return Ok(Some(FsType::F2fs)),
            _ => {}
        }
    }
    if let Some(b) = read_at::<2>(&mut file, EXT4_MAGIC_OFFSET)? {
        if u16::from_le_bytes(b) == EXT4_MAGIC {
            return Ok(Some(FsType::Ext4));
        }
    }
    Ok(None)
}

/// Ask `blkid`, then fall back to signature matching.
pub fn detect_fs_type(image: &Path) -> Result<FsType> {
    if process::exists("blkid") {
        let result = Cmd::new("blkid")
            .args(["-o", "value", "-s", "TYPE"])
            .arg_path(image)
            .allow_fail()
            .run()?;
        if result.success() {
            match result.stdout_trimmed().parse::<FsType>() {
                Ok(fs) => return Ok(fs),
                Err(e) => tracing::debug!("blkid answer not usable: {}", e),
            }
        }
    }

    match detect_by_signature(image)? {
        Some(fs) => Ok(fs),
        None => bail!(
            "Could not determine the filesystem of {} (not ext4, EROFS or F2FS)",
            image.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn image_with(bytes_at: &[(u64, &[u8])]) -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("probe.img");
        let mut data = vec![0u8; 4096];
        for (offset, bytes) in bytes_at {
            let start = *offset as usize;
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        File::create(&path).unwrap().write_all(&data).unwrap();
        (temp, path)
    }

    #[test]
    fn sparse_header_detected() {
        let (_t, path) = image_with(&[(0, &SPARSE_MAGIC.to_le_bytes())]);
        assert!(is_sparse(&path).unwrap());
    }

    #[test]
    fn raw_image_is_not_sparse() {
        let (_t, path) = image_with(&[]);
        assert!(!is_sparse(&path).unwrap());
    }

    #[test]
    fn ext4_signature() {
        let (_t, path) = image_with(&[(EXT4_MAGIC_OFFSET, &EXT4_MAGIC.to_le_bytes())]);
        assert_eq!(detect_by_signature(&path).unwrap(), Some(FsType::Ext4));
    }

    #[test]
    fn erofs_signature() {
        let (_t, path) = image_with(&[(SUPER_OFFSET, &EROFS_MAGIC.to_le_bytes())]);
        assert_eq!(detect_by_signature(&path).unwrap(), Some(FsType::Erofs));
    }

    #[test]
    fn f2fs_signature() {
        let (_t, path) = image_with(&[(SUPER_OFFSET, &F2FS_MAGIC.to_le_bytes())]);
        assert_eq!(detect_by_signature(&path).unwrap(), Some(FsType::F2fs));
    }

    #[test]
    fn short_file_has_no_signature() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tiny.img");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(detect_by_signature(&path).unwrap(), None);
        assert!(!is_sparse(&path).unwrap());
    }
}
