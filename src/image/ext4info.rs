//! Superblock facts read back from `dumpe2fs -h` / `dump.erofs`.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;

use crate::process::{self, Cmd};

/// Feature flag marking deduplicated (copy-on-write) blocks.
pub const SHARED_BLOCKS_FEATURE: &str = "shared_blocks";

/// Geometry and identity of an ext4 filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Ext4Geometry {
    pub block_size: u64,
    pub block_count: u64,
    pub inode_size: u64,
    pub inode_count: u64,
    pub uuid: Option<String>,
    pub volume_label: Option<String>,
    pub features: Vec<String>,
    pub reserved_percent: f64,
}

impl Ext4Geometry {
    pub fn has_feature(&self, name: &str) -> bool {
        self.features.iter().any(|f| f == name)
    }

    pub fn shared_blocks(&self) -> bool {
        self.has_feature(SHARED_BLOCKS_FEATURE)
    }

    pub fn size_bytes(&self) -> u64 {
        self.block_size * self.block_count
    }
}

/// Split `Key:   value` lines into a map; later duplicates are ignored.
pub fn parse_key_values(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            map.entry(key.trim().to_string())
                .or_insert_with(|| value.trim().to_string());
        }
    }
    map
}

fn optional_text(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "<none>" && *v != "<not available>")
        .map(str::to_string)
}

fn required_u64(map: &HashMap<String, String>, key: &str) -> Result<u64> {
    let raw = map
        .get(key)
        .with_context(|| format!("dumpe2fs output lacks '{}'", key))?;
    raw.parse::<u64>()
        .with_context(|| format!("dumpe2fs '{}' is not a number: {}", key, raw))
}

/// Parse `dumpe2fs -h` output.
pub fn parse_dumpe2fs(output: &str) -> Result<Ext4Geometry> {
    let map = parse_key_values(output);

    let block_size = required_u64(&map, "Block size")?;
    let block_count = required_u64(&map, "Block count")?;
    let inode_size = required_u64(&map, "Inode size")?;
    let inode_count = required_u64(&map, "Inode count")?;
    let reserved = map
        .get("Reserved block count")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    if block_count == 0 {
        bail!("dumpe2fs reports a zero block count");
    }

    let features = map
        .get("Filesystem features")
        .map(|v| {
            v.split_whitespace()
                .filter(|f| *f != "(none)")
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let reserved_percent = (reserved as f64 * 100.0 / block_count as f64 * 100.0).round() / 100.0;

    Ok(Ext4Geometry {
        block_size,
        block_count,
        inode_size,
        inode_count,
        uuid: optional_text(map.get("Filesystem UUID")),
        volume_label: optional_text(map.get("Filesystem volume name")),
        features,
        reserved_percent,
    })
}

/// Run `dumpe2fs -h` on an image.
pub fn read_geometry(image: &Path) -> Result<Ext4Geometry> {
    let result = Cmd::new("dumpe2fs")
        .arg("-h")
        .arg_path(image)
        .error_msg(format!("dumpe2fs could not read {}", image.display()))
        .run()?;
    parse_dumpe2fs(&result.stdout)
}

/// UUID and volume label of an EROFS image, if `dump.erofs` reports them.
pub fn read_erofs_identity(image: &Path) -> (Option<String>, Option<String>) {
    if !process::exists("dump.erofs") {
        return (None, None);
    }
    match Cmd::new("dump.erofs").arg_path(image).run() {
        Ok(result) => {
            let map = parse_key_values(&result.stdout);
            (
                optional_text(map.get("Filesystem UUID")),
                optional_text(map.get("Filesystem volume name")),
            )
        }
        Err(e) => {
            tracing::warn!("dump.erofs failed, UUID/label not recorded: {:#}", e);
            (None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
dumpe2fs 1.47.0 (5-Feb-2023)
Filesystem volume name:   /
Last mounted on:          /
Filesystem UUID:          d4a2e5c0-8a57-4bd0-9b1c-2b3b1f0d4f11
Filesystem magic number:  0xEF53
Filesystem features:      ext_attr dir_index filetype extent sparse_super large_file huge_file dir_nlink extra_isize shared_blocks
Inode count:              4096
Block count:              262144
Reserved block count:     0
Block size:               4096
Inode size:	          256
Journal backup:           inode blocks
";

    #[test]
    fn parses_android_superblock() {
        let geo = parse_dumpe2fs(SAMPLE).unwrap();
        assert_eq!(geo.block_size, 4096);
        assert_eq!(geo.block_count, 262144);
        assert_eq!(geo.inode_size, 256);
        assert_eq!(geo.inode_count, 4096);
        assert_eq!(geo.volume_label.as_deref(), Some("/"));
        assert_eq!(
            geo.uuid.as_deref(),
            Some("d4a2e5c0-8a57-4bd0-9b1c-2b3b1f0d4f11")
        );
        assert!(geo.shared_blocks());
        assert!(!geo.has_feature("has_journal"));
        assert_eq!(geo.reserved_percent, 0.0);
        assert_eq!(geo.size_bytes(), 1 << 30);
    }

    #[test]
    fn none_label_is_empty() {
        let out = SAMPLE.replace("Filesystem volume name:   /", "Filesystem volume name:   <none>");
        assert_eq!(parse_dumpe2fs(&out).unwrap().volume_label, None);
    }

    #[test]
    fn reserved_percentage() {
        let out = SAMPLE.replace("Reserved block count:     0", "Reserved block count:     13107");
        assert_eq!(parse_dumpe2fs(&out).unwrap().reserved_percent, 5.0);
    }

    #[test]
    fn missing_block_size_is_error() {
        let out = SAMPLE.replace("Block size:               4096\n", "");
        assert!(parse_dumpe2fs(&out).is_err());
    }
}
