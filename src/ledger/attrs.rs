//! Per-path ownership, permission and label records.
//!
//! All three ledgers are ordered maps keyed by image-absolute path. Because
//! every key starts with `/`, the root sorts first, which is the invariant the
//! resolver depends on.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::paths::ancestors;

/// Permission bits kept in ledgers (type bits are dropped).
pub const MODE_MASK: u32 = 0o7777;

/// Octal string (de)serialization for mode fields, e.g. `"0755"`.
mod octal {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &u32, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:04o}", mode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let raw = String::deserialize(d)?;
        u32::from_str_radix(raw.trim_start_matches("0o"), 8)
            .map_err(|e| D::Error::custom(format!("invalid octal mode '{}': {}", raw, e)))
    }
}

/// Coarse object type. Devices, fifos and sockets count as files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Directory,
    File,
    Symlink,
}

impl ObjectKind {
    pub fn of(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            ObjectKind::Symlink
        } else if file_type.is_dir() {
            ObjectKind::Directory
        } else {
            ObjectKind::File
        }
    }
}

/// Owner and permission bits of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    pub uid: u32,
    pub gid: u32,
    #[serde(with = "octal")]
    pub mode: u32,
    /// Absent in ledgers that predate kind tracking; matches any kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ObjectKind>,
}

impl AttributeRecord {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            uid,
            gid,
            mode: mode & MODE_MASK,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ObjectKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// False only when the recorded kind is known and differs.
    pub fn matches_kind(&self, kind: ObjectKind) -> bool {
        self.kind.map_or(true, |recorded| recorded == kind)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AttributeEntry {
    path: String,
    #[serde(flatten)]
    record: AttributeRecord,
}

/// Ordered, unique-by-path ownership ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeLedger {
    entries: BTreeMap<String, AttributeRecord>,
}

impl AttributeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `path` unless it is already present. Returns whether it was added.
    pub fn insert(&mut self, path: impl Into<String>, record: AttributeRecord) -> bool {
        let path = path.into();
        if self.entries.contains_key(&path) {
            tracing::debug!("duplicate attribute entry ignored: {}", path);
            return false;
        }
        self.entries.insert(path, record);
        true
    }

    pub fn get(&self, path: &str) -> Option<&AttributeRecord> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Nearest strict ancestor of `path` with an entry, root inclusive.
    pub fn nearest_ancestor<'a>(&'a self, path: &'a str) -> Option<(&'a str, &'a AttributeRecord)> {
        ancestors(path).find_map(|anc| self.entries.get(anc).map(|rec| (anc, rec)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<AttributeEntry> = self
            .entries
            .iter()
            .map(|(path, record)| AttributeEntry {
                path: path.clone(),
                record: *record,
            })
            .collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Parse and validate: unique paths, root present whenever non-empty.
    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<AttributeEntry> = serde_json::from_str(raw)?;
        let mut ledger = Self::new();
        for entry in entries {
            if !entry.path.starts_with('/') {
                bail!("attribute ledger path is not image-absolute: {}", entry.path);
            }
            if !ledger.insert(entry.path.clone(), entry.record) {
                bail!("attribute ledger has duplicate path {}", entry.path);
            }
        }
        if !ledger.is_empty() && !ledger.contains("/") {
            bail!("attribute ledger has no root entry");
        }
        Ok(ledger)
    }
}

/// A recorded symbolic link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkRecord {
    pub target: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(with = "octal")]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SymlinkEntry {
    path: String,
    #[serde(flatten)]
    record: SymlinkRecord,
}

/// Symlinks, kept apart because they carry a target instead of content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymlinkLedger {
    entries: BTreeMap<String, SymlinkRecord>,
}

impl SymlinkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, record: SymlinkRecord) -> bool {
        let path = path.into();
        if self.entries.contains_key(&path) {
            return false;
        }
        self.entries.insert(path, record);
        true
    }

    pub fn get(&self, path: &str) -> Option<&SymlinkRecord> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SymlinkRecord)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<SymlinkEntry> = self
            .entries
            .iter()
            .map(|(path, record)| SymlinkEntry {
                path: path.clone(),
                record: record.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<SymlinkEntry> = serde_json::from_str(raw)?;
        let mut ledger = Self::new();
        for entry in entries {
            if !ledger.insert(entry.path.clone(), entry.record) {
                bail!("symlink ledger has duplicate path {}", entry.path);
            }
        }
        Ok(ledger)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelEntry {
    path: String,
    label: String,
}

/// Security labels; only objects whose label could be read appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelLedger {
    entries: BTreeMap<String, String>,
}

impl LabelLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, label: impl Into<String>) -> bool {
        let path = path.into();
        if self.entries.contains_key(&path) {
            return false;
        }
        self.entries.insert(path, label.into());
        true
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Nearest strict ancestor of `path` with a label, root inclusive.
    pub fn nearest_ancestor<'a>(&'a self, path: &'a str) -> Option<(&'a str, &'a str)> {
        ancestors(path).find_map(|anc| self.entries.get(anc).map(|l| (anc, l.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<LabelEntry> = self
            .entries
            .iter()
            .map(|(path, label)| LabelEntry {
                path: path.clone(),
                label: label.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<LabelEntry> = serde_json::from_str(raw)?;
        let mut ledger = Self::new();
        for entry in entries {
            if !ledger.insert(entry.path.clone(), entry.label) {
                bail!("label ledger has duplicate path {}", entry.path);
            }
        }
        Ok(ledger)
    }
}
