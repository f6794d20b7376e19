//! Sidecar ledgers written next to an extracted tree.
//!
//! ```text
//! <dest>/
//! ├── ...extracted content...
//! └── .repack_info/
//!     ├── attributes.json   AttributeLedger
//!     ├── labels.json       LabelLedger
//!     ├── symlinks.json     SymlinkLedger
//!     ├── checksums.json    ChecksumBaseline
//!     └── metadata.env      ImageMetadata (KEY=value)
//! ```
//!
//! In memory everything is an ordered map; the files are only touched at the
//! process boundary.

pub mod attrs;
pub mod checksum;
pub mod metadata;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub use attrs::{
    AttributeLedger, AttributeRecord, LabelLedger, ObjectKind, SymlinkLedger, SymlinkRecord,
};
pub use checksum::{ChecksumBaseline, ModificationReport};
pub use metadata::ImageMetadata;

/// Name of the sidecar directory inside an extracted tree.
pub const INFO_DIR: &str = ".repack_info";

const ATTRIBUTES_FILE: &str = "attributes.json";
const LABELS_FILE: &str = "labels.json";
const SYMLINKS_FILE: &str = "symlinks.json";
const CHECKSUMS_FILE: &str = "checksums.json";
const METADATA_FILE: &str = "metadata.env";

/// Locations of the sidecar files for one extracted tree.
#[derive(Debug, Clone)]
pub struct Sidecar {
    dir: PathBuf,
}

impl Sidecar {
    pub fn for_tree(tree: &Path) -> Self {
        Self {
            dir: tree.join(INFO_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(ATTRIBUTES_FILE).is_file()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn write(&self, name: &str, content: &str) -> Result<()> {
        let path = self.dir.join(name);
        fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.dir.join(name);
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    /// Read an optional file; missing is `None`, unreadable is an error.
    fn read_optional(&self, name: &str) -> Result<Option<String>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        self.read(name).map(Some)
    }
}

/// Everything harvested from a source image.
#[derive(Debug, Clone, Default)]
pub struct Ledgers {
    pub attributes: AttributeLedger,
    pub symlinks: SymlinkLedger,
    pub labels: LabelLedger,
}

impl Ledgers {
    pub fn save(&self, sidecar: &Sidecar) -> Result<()> {
        fs::create_dir_all(sidecar.dir())
            .with_context(|| format!("Failed to create {}", sidecar.dir().display()))?;
        sidecar.write(ATTRIBUTES_FILE, &self.attributes.to_json()?)?;
        sidecar.write(SYMLINKS_FILE, &self.symlinks.to_json()?)?;
        sidecar.write(LABELS_FILE, &self.labels.to_json()?)?;
        Ok(())
    }

    /// Load the ledgers. A missing attribute ledger is fatal; the symlink
    /// and label ledgers may be absent (treated as empty).
    pub fn load(sidecar: &Sidecar) -> Result<Self> {
        if !sidecar.exists() {
            bail!(
                "No attribute ledger in {}. Was this directory produced by 'repackfs unpack'?",
                sidecar.dir().display()
            );
        }

        let attributes = AttributeLedger::from_json(&sidecar.read(ATTRIBUTES_FILE)?)
            .context("Invalid attribute ledger")?;
        if attributes.is_empty() {
            bail!("Attribute ledger in {} is empty", sidecar.dir().display());
        }

        let symlinks = match sidecar.read_optional(SYMLINKS_FILE)? {
            Some(raw) => SymlinkLedger::from_json(&raw).context("Invalid symlink ledger")?,
            None => SymlinkLedger::new(),
        };
        let labels = match sidecar.read_optional(LABELS_FILE)? {
            Some(raw) => LabelLedger::from_json(&raw).context("Invalid label ledger")?,
            None => LabelLedger::new(),
        };

        Ok(Self {
            attributes,
            symlinks,
            labels,
        })
    }
}

pub fn save_baseline(sidecar: &Sidecar, baseline: &ChecksumBaseline) -> Result<()> {
    fs::create_dir_all(sidecar.dir())?;
    sidecar.write(CHECKSUMS_FILE, &baseline.to_json()?)
}

/// Missing baseline yields `None`; modification detection is then skipped.
pub fn load_baseline(sidecar: &Sidecar) -> Result<Option<ChecksumBaseline>> {
    sidecar
        .read_optional(CHECKSUMS_FILE)?
        .map(|raw| ChecksumBaseline::from_json(&raw).context("Invalid checksum baseline"))
        .transpose()
}

pub fn save_metadata(sidecar: &Sidecar, metadata: &ImageMetadata) -> Result<()> {
    fs::create_dir_all(sidecar.dir())?;
    metadata.write(&sidecar.metadata_path())
}

/// Missing metadata yields `None`; strict mode turns that into an error.
pub fn load_metadata(sidecar: &Sidecar) -> Result<Option<ImageMetadata>> {
    let path = sidecar.metadata_path();
    if !path.exists() {
        return Ok(None);
    }
    ImageMetadata::read(&path).map(Some)
}
