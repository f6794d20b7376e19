//! Content baselines and modification detection.
//!
//! Uses SHA-256 over file contents, never mtimes: editors and copy tools
//! touch timestamps freely, and only content changes matter here.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

use super::INFO_DIR;
use crate::common::paths::image_path;

/// SHA-256 of a file's contents as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Serialize, Deserialize)]
struct ChecksumEntry {
    path: String,
    sha256: String,
}

/// Content hash per regular file of a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumBaseline {
    entries: BTreeMap<String, String>,
}

impl ChecksumBaseline {
    /// Hash every regular file below `root`, skipping the sidecar directory.
    pub fn compute(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !(e.depth() == 1 && e.file_name() == INFO_DIR));

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let key = image_path(root, entry.path())?;
            entries.insert(key, hash_file(entry.path())?);
        }

        Ok(Self { entries })
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compare a fresh scan against this baseline.
    pub fn diff(&self, current: &ChecksumBaseline) -> ModificationReport {
        let mut report = ModificationReport::default();

        for (path, hash) in &current.entries {
            match self.entries.get(path) {
                Some(old) if old != hash => report.modified.push(path.clone()),
                Some(_) => {}
                None => report.added.push(path.clone()),
            }
        }
        for path in self.entries.keys() {
            if !current.entries.contains_key(path) {
                report.removed.push(path.clone());
            }
        }

        report
    }

    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<ChecksumEntry> = self
            .entries
            .iter()
            .map(|(path, sha256)| ChecksumEntry {
                path: path.clone(),
                sha256: sha256.clone(),
            })
            .collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<ChecksumEntry> = serde_json::from_str(raw)?;
        Ok(Self {
            entries: entries.into_iter().map(|e| (e.path, e.sha256)).collect(),
        })
    }
}

/// Differences between a baseline and the current tree. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModificationReport {
    pub modified: Vec<String>,
    /// Not in the baseline; attributes come from ancestor inheritance.
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ModificationReport {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        if self.is_clean() {
            println!("  No content changes since extraction.");
            return;
        }
        println!(
            "  Content changes: {} modified, {} new, {} removed",
            self.modified.len(),
            self.added.len(),
            self.removed.len()
        );
        for path in &self.modified {
            println!("    M {}", path);
        }
        for path in &self.added {
            println!("    + {}", path);
        }
        for path in &self.removed {
            println!("    - {}", path);
        }
    }
}
