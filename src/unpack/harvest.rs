//! One-pass attribute harvesting over a mounted tree.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::common::paths::image_path;
use crate::ledger::{AttributeRecord, Ledgers, ObjectKind, SymlinkRecord};
use crate::process::{self, Cmd};
use crate::selinux;

/// Values some tools print instead of a real label.
const PLACEHOLDER_LABELS: &[&str] = &["?", "unlabeled", "(null)"];

/// True if `label` is a usable context string.
pub fn is_real_label(label: &str) -> bool {
    let label = label.trim();
    !label.is_empty() && !PLACEHOLDER_LABELS.contains(&label)
}

/// One way of reading an object's security label.
///
/// Kernel mounts expose the xattr directly; FUSE drivers and odd hosts
/// sometimes only answer through the userland tools, so several sources are
/// tried in order.
pub trait LabelSource {
    fn name(&self) -> &'static str;
    fn label(&self, path: &Path) -> Option<String>;
}

/// `lgetxattr(security.selinux)`.
pub struct XattrLabels;

impl LabelSource for XattrLabels {
    fn name(&self) -> &'static str {
        "xattr"
    }

    fn label(&self, path: &Path) -> Option<String> {
        selinux::read_label_xattr(path).ok().flatten()
    }
}

/// `getfattr -h --only-values -n security.selinux`.
pub struct GetfattrLabels;

impl LabelSource for GetfattrLabels {
    fn name(&self) -> &'static str {
        "getfattr"
    }

    fn label(&self, path: &Path) -> Option<String> {
        let result = Cmd::new("getfattr")
            .args(["-h", "--absolute-names", "--only-values", "-n", selinux::LABEL_XATTR])
            .arg_path(path)
            .allow_fail()
            .run()
            .ok()?;
        if !result.success() {
            return None;
        }
        Some(result.stdout.trim_end_matches('\0').trim().to_string())
    }
}

/// `stat -c %C` (does not follow symlinks).
pub struct StatLabels;

impl LabelSource for StatLabels {
    fn name(&self) -> &'static str {
        "stat"
    }

    fn label(&self, path: &Path) -> Option<String> {
        let result = Cmd::new("stat")
            .args(["-c", "%C"])
            .arg_path(path)
            .allow_fail()
            .run()
            .ok()?;
        if !result.success() {
            return None;
        }
        Some(result.stdout_trimmed().to_string())
    }
}

/// The standard three-strategy chain, skipping tools the host lacks.
pub fn default_label_sources() -> Vec<Box<dyn LabelSource>> {
    let mut sources: Vec<Box<dyn LabelSource>> = vec![Box::new(XattrLabels)];
    if process::exists("getfattr") {
        sources.push(Box::new(GetfattrLabels));
    }
    if process::exists("stat") {
        sources.push(Box::new(StatLabels));
    }
    sources
}

/// Counters reported after a harvest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestStats {
    pub objects: usize,
    pub symlinks: usize,
    pub labeled: usize,
    pub skipped_symlinks: usize,
}

/// Walks a mounted tree and fills [`Ledgers`].
pub struct Harvester {
    sources: Vec<Box<dyn LabelSource>>,
}

impl Harvester {
    pub fn new(sources: Vec<Box<dyn LabelSource>>) -> Self {
        Self { sources }
    }

    /// First real label from the source chain.
    pub fn lookup_label(&self, path: &Path) -> Option<String> {
        for source in &self.sources {
            if let Some(label) = source.label(path) {
                if is_real_label(&label) {
                    return Some(label.trim().to_string());
                }
            }
            tracing::trace!("{}: no label via {}", path.display(), source.name());
        }
        None
    }

    /// Harvest `root`. The root object is recorded before the walk starts.
    pub fn harvest(&self, root: &Path) -> Result<(Ledgers, HarvestStats)> {
        let mut ledgers = Ledgers::default();
        let mut stats = HarvestStats::default();

        let root_meta = fs::symlink_metadata(root)
            .with_context(|| format!("Failed to stat mount root {}", root.display()))?;
        self.record_object(&mut ledgers, &mut stats, "/".to_string(), root, &root_meta);

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter();

        for entry in walker {
            crate::interrupt::check()?;
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let path = entry.path();
            let key = image_path(root, path)?;

            if entry.path_is_symlink() {
                if self.record_symlink(&mut ledgers, &key, path) {
                    stats.symlinks += 1;
                } else {
                    stats.skipped_symlinks += 1;
                }
                continue;
            }

            let meta = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            self.record_object(&mut ledgers, &mut stats, key, path, &meta);
        }

        Ok((ledgers, stats))
    }

    fn record_object(
        &self,
        ledgers: &mut Ledgers,
        stats: &mut HarvestStats,
        key: String,
        path: &Path,
        meta: &fs::Metadata,
    ) {
        let record = AttributeRecord::new(meta.uid(), meta.gid(), meta.mode())
            .with_kind(ObjectKind::of(meta.file_type()));
        if let Some(label) = self.lookup_label(path) {
            ledgers.labels.insert(key.clone(), label);
            stats.labeled += 1;
        }
        if ledgers.attributes.insert(key, record) {
            stats.objects += 1;
        }
    }

    /// Soft failure: returns false and records nothing if the target or
    /// lstat cannot be read.
    fn record_symlink(&self, ledgers: &mut Ledgers, key: &str, path: &Path) -> bool {
        let target = match fs::read_link(path) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!("skipping symlink {}: {}", path.display(), e);
                return false;
            }
        };
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("skipping symlink {}: {}", path.display(), e);
                return false;
            }
        };

        let record = SymlinkRecord {
            target: target.to_string_lossy().into_owned(),
            uid: meta.uid(),
            gid: meta.gid(),
            mode: meta.mode() & crate::ledger::attrs::MODE_MASK,
            label: self.lookup_label(path),
        };
        ledgers.symlinks.insert(key, record)
    }
}
