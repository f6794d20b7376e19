//! Flexible-mode size estimation.
//!
//! ```text
//! content   = regular file bytes + symlink target bytes
//! rounding  = 3% of content
//! metadata  = 16 MiB + 4 KiB/dir + 2% of content + 8 MiB + inodes * 256
//! subtotal  = content + rounding + metadata
//! total     = subtotal * (100 + overhead) / 100, rounded up to 4 KiB
//! ```

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use walkdir::WalkDir;

use crate::ledger::INFO_DIR;

pub const BLOCK_SIZE: u64 = 4096;
const MIB: u64 = 1024 * 1024;

const METADATA_BASE: u64 = 16 * MIB;
const PER_DIRECTORY: u64 = 4096;
const SAFETY_MARGIN: u64 = 8 * MIB;
const INODE_BYTES: u64 = 256;
const EXTRA_INODES: u64 = 1024;

/// Bounded number of create/mount/copy attempts.
pub const MAX_ATTEMPTS: u32 = 5;

/// Largest accepted overhead percentage.
pub const MAX_OVERHEAD: u32 = 500;

/// User-selected slack on top of the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OverheadPercent(u32);

impl OverheadPercent {
    pub const SMALL: Self = Self(10);
    pub const MEDIUM: Self = Self(15);
    pub const LARGE: Self = Self(20);

    pub fn new(percent: u32) -> Result<Self> {
        if percent > MAX_OVERHEAD {
            bail!("overhead {}% is out of range (0..={})", percent, MAX_OVERHEAD);
        }
        Ok(Self(percent))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl FromStr for OverheadPercent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let n: u32 = s
            .trim()
            .trim_end_matches('%')
            .parse()
            .with_context(|| format!("overhead '{}' is not a whole percentage", s))?;
        Self::new(n)
    }
}

impl fmt::Display for OverheadPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Aggregate counts of a tree, excluding the sidecar directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub file_bytes: u64,
    pub symlink_bytes: u64,
    pub directories: u64,
    /// Every object, including directories and the root.
    pub objects: u64,
}

impl TreeStats {
    pub fn scan(root: &Path) -> Result<Self> {
        let mut stats = Self::default();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == INFO_DIR));

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            stats.objects += 1;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                stats.directories += 1;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .with_context(|| format!("Failed to read link {}", entry.path().display()))?;
                stats.symlink_bytes += target.as_os_str().len() as u64;
            } else if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
                stats.file_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    pub fn content_bytes(&self) -> u64 {
        self.file_bytes + self.symlink_bytes
    }
}

/// The sizing decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub content_bytes: u64,
    pub inode_count: u64,
    pub total_bytes: u64,
}

impl SizeEstimate {
    pub fn blocks(&self) -> u64 {
        self.total_bytes / BLOCK_SIZE
    }

    /// Next attempt: 10% larger.
    pub fn grown(&self) -> Self {
        Self {
            total_bytes: grow(self.total_bytes),
            ..*self
        }
    }
}

pub fn round_up_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn percent_of(value: u64, percent: u64) -> u64 {
    (value * percent).div_ceil(100)
}

/// objects + 25% + 1024, rounded up to a multiple of 8.
pub fn inode_count(objects: u64) -> u64 {
    (objects + objects / 4 + EXTRA_INODES).div_ceil(8) * 8
}

pub fn estimate(stats: &TreeStats, overhead: OverheadPercent) -> SizeEstimate {
    let content = stats.content_bytes();
    let inodes = inode_count(stats.objects);

    let rounding = percent_of(content, 3);
    let metadata = METADATA_BASE
        + stats.directories * PER_DIRECTORY
        + percent_of(content, 2)
        + SAFETY_MARGIN
        + inodes * INODE_BYTES;
    let subtotal = content + rounding + metadata;
    let total = subtotal + percent_of(subtotal, overhead.get() as u64);

    SizeEstimate {
        content_bytes: content,
        inode_count: inodes,
        total_bytes: round_up_blocks(total),
    }
}

/// Grow by 10%, staying block aligned and strictly larger.
pub fn grow(bytes: u64) -> u64 {
    round_up_blocks(bytes + percent_of(bytes, 10)).max(bytes + BLOCK_SIZE)
}

/// Free space a mounted image must have before copying: content + 5%.
pub fn required_free(content_bytes: u64) -> u64 {
    content_bytes + percent_of(content_bytes, 5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stats(bytes: u64, dirs: u64, objects: u64) -> TreeStats {
        TreeStats {
            file_bytes: bytes,
            symlink_bytes: 0,
            directories: dirs,
            objects,
        }
    }

    #[test]
    fn overhead_parsing() {
        assert_eq!("15".parse::<OverheadPercent>().unwrap(), OverheadPercent::MEDIUM);
        assert_eq!("20%".parse::<OverheadPercent>().unwrap().get(), 20);
        assert_eq!("0".parse::<OverheadPercent>().unwrap().get(), 0);
        assert!("501".parse::<OverheadPercent>().is_err());
        assert!("lots".parse::<OverheadPercent>().is_err());
    }

    #[test]
    fn inode_count_is_multiple_of_eight() {
        assert_eq!(inode_count(0), 1024);
        assert_eq!(inode_count(100), 1152);
        assert_eq!(inode_count(3) % 8, 0);
    }

    #[test]
    fn empty_tree_has_fixed_floor() {
        let e = estimate(&TreeStats::default(), OverheadPercent::new(0).unwrap());
        // 16 MiB + 8 MiB + 1024 inodes * 256
        assert_eq!(e.total_bytes, 24 * MIB + 1024 * 256);
        assert_eq!(e.total_bytes % BLOCK_SIZE, 0);
    }

    #[test]
    fn known_estimate() {
        let e = estimate(&stats(100 * MIB, 10, 100), OverheadPercent::MEDIUM);
        let content = 100 * MIB;
        let subtotal = content
            + percent_of(content, 3)
            + 16 * MIB
            + 10 * 4096
            + percent_of(content, 2)
            + 8 * MIB
            + 1152 * 256;
        assert_eq!(
            e.total_bytes,
            round_up_blocks(subtotal + percent_of(subtotal, 15))
        );
        assert_eq!(e.content_bytes, content);
    }

    #[test]
    fn larger_overhead_never_shrinks() {
        let s = stats(512 * MIB + 7, 300, 4000);
        let mut last = 0;
        for pct in [0, 10, 15, 20, 50, 500] {
            let blocks = estimate(&s, OverheadPercent::new(pct).unwrap()).blocks();
            assert!(blocks >= last, "{}% gave {} < {}", pct, blocks, last);
            last = blocks;
        }
    }

    #[test]
    fn growth_is_strict_and_aligned() {
        let start = round_up_blocks(10 * MIB);
        let next = grow(start);
        assert!(next > start);
        assert_eq!(next % BLOCK_SIZE, 0);
        assert!(grow(0) > 0);
    }

    #[test]
    fn required_free_adds_five_percent() {
        assert_eq!(required_free(100), 105);
        assert_eq!(required_free(0), 0);
    }

    #[test]
    fn scan_counts_content_and_skips_sidecar() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join(INFO_DIR)).unwrap();
        fs::write(root.join(INFO_DIR).join("attributes.json"), vec![0u8; 999]).unwrap();
        fs::write(root.join("bin/sh"), vec![0u8; 100]).unwrap();
        std::os::unix::fs::symlink("bin/sh", root.join("sh")).unwrap();

        let s = TreeStats::scan(root).unwrap();
        assert_eq!(s.file_bytes, 100);
        assert_eq!(s.symlink_bytes, 6);
        assert_eq!(s.directories, 2); // root + bin
        assert_eq!(s.objects, 4);
    }
}
