//! Flat `KEY=value` image metadata record.
//!
//! Written once at the end of unpack, read once at the start of repack.
//! Unknown values are written empty, never as a placeholder token.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::image::ext4info::Ext4Geometry;
use crate::image::{FsType, MountMethod};

const KEY_SOURCE_IMAGE: &str = "SOURCE_IMAGE";
const KEY_FS_TYPE: &str = "FS_TYPE";
const KEY_MOUNT_METHOD: &str = "MOUNT_METHOD";
const KEY_BLOCK_SIZE: &str = "BLOCK_SIZE";
const KEY_BLOCK_COUNT: &str = "BLOCK_COUNT";
const KEY_INODE_SIZE: &str = "INODE_SIZE";
const KEY_INODE_COUNT: &str = "INODE_COUNT";
const KEY_UUID: &str = "UUID";
const KEY_VOLUME_LABEL: &str = "VOLUME_LABEL";
const KEY_FEATURES: &str = "FEATURES";
const KEY_RESERVED_PERCENT: &str = "RESERVED_PERCENT";
const KEY_SHARED_BLOCKS: &str = "SHARED_BLOCKS";

/// Facts about the source image needed at repack time.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMetadata {
    pub source_image: PathBuf,
    pub fs_type: FsType,
    pub mount_method: MountMethod,
    pub uuid: Option<String>,
    pub volume_label: Option<String>,
    /// Present only for ext4 sources whose superblock could be read.
    pub ext4: Option<Ext4Geometry>,
}

impl ImageMetadata {
    pub fn shared_blocks(&self) -> bool {
        self.ext4.as_ref().map(|g| g.shared_blocks()).unwrap_or(false)
    }

    /// Serialize in a fixed key order.
    pub fn to_env_string(&self) -> String {
        let geo = self.ext4.as_ref();
        let num = |f: fn(&Ext4Geometry) -> u64| geo.map(|g| f(g).to_string()).unwrap_or_default();

        let uuid = self
            .uuid
            .clone()
            .or_else(|| geo.and_then(|g| g.uuid.clone()))
            .unwrap_or_default();
        let label = self
            .volume_label
            .clone()
            .or_else(|| geo.and_then(|g| g.volume_label.clone()))
            .unwrap_or_default();

        let pairs = [
            (KEY_SOURCE_IMAGE, self.source_image.display().to_string()),
            (KEY_FS_TYPE, self.fs_type.to_string()),
            (KEY_MOUNT_METHOD, self.mount_method.to_string()),
            (KEY_BLOCK_SIZE, num(|g| g.block_size)),
            (KEY_BLOCK_COUNT, num(|g| g.block_count)),
            (KEY_INODE_SIZE, num(|g| g.inode_size)),
            (KEY_INODE_COUNT, num(|g| g.inode_count)),
            (KEY_UUID, uuid),
            (KEY_VOLUME_LABEL, label),
            (
                KEY_FEATURES,
                geo.map(|g| g.features.join(",")).unwrap_or_default(),
            ),
            (
                KEY_RESERVED_PERCENT,
                geo.map(|g| format_percent(g.reserved_percent))
                    .unwrap_or_default(),
            ),
            (
                KEY_SHARED_BLOCKS,
                geo.map(|g| g.shared_blocks().to_string()).unwrap_or_default(),
            ),
        ];

        let mut out = String::new();
        for (key, value) in pairs {
            let _ = writeln!(out, "{}={}", key, quote(&value));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_env_string())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Parse from a key/value map (as produced by dotenvy).
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| map.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let fs_type: FsType = get(KEY_FS_TYPE)
            .context("metadata lacks FS_TYPE")?
            .parse()?;
        let mount_method: MountMethod = get(KEY_MOUNT_METHOD)
            .context("metadata lacks MOUNT_METHOD")?
            .parse()?;
        let source_image = PathBuf::from(get(KEY_SOURCE_IMAGE).unwrap_or_default());
        let uuid = get(KEY_UUID).map(str::to_string);
        let volume_label = get(KEY_VOLUME_LABEL).map(str::to_string);

        let number = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>()
                        .with_context(|| format!("metadata {} is not a number: {}", key, v))
                })
                .transpose()
        };

        let ext4 = match (
            fs_type,
            number(KEY_BLOCK_SIZE)?,
            number(KEY_BLOCK_COUNT)?,
        ) {
            (FsType::Ext4, Some(block_size), Some(block_count)) => Some(Ext4Geometry {
                block_size,
                block_count,
                inode_size: number(KEY_INODE_SIZE)?.unwrap_or(256),
                inode_count: number(KEY_INODE_COUNT)?.unwrap_or(0),
                uuid: uuid.clone(),
                volume_label: volume_label.clone(),
                features: get(KEY_FEATURES)
                    .map(|v| {
                        v.split(',')
                            .map(|f| f.trim().to_string())
                            .filter(|f| !f.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                reserved_percent: get(KEY_RESERVED_PERCENT)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0),
            }),
            _ => None,
        };

        Ok(Self {
            source_image,
            fs_type,
            mount_method,
            uuid,
            volume_label,
            ext4,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut map = HashMap::new();
        let iter = dotenvy::from_path_iter(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for item in iter {
            let (key, value) =
                item.with_context(|| format!("Malformed line in {}", path.display()))?;
            map.insert(key, value);
        }
        Self::from_map(&map)
            .with_context(|| format!("Invalid image metadata in {}", path.display()))
    }
}

fn format_percent(p: f64) -> String {
    let s = format!("{:.2}", p);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Double-quote values that dotenv would otherwise reinterpret. Inside
/// double quotes dotenv expands `$` and honours backslash escapes.
fn quote(value: &str) -> String {
    if value.is_empty()
        || value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-,:".contains(c))
    {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '$' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
