//! Attribute resolution and restoration over an edited tree.
//!
//! Every object gets an assignment: an exact ledger hit, or ownership from the
//! nearest recorded ancestor. New directories take the ancestor's mode; every
//! other new object gets [`NEW_FILE_MODE`]. Labels resolve independently
//! against the label ledger, so the label ancestor may differ from the
//! ownership ancestor. An exact record whose recorded kind differs from the
//! object on disk is ignored, so a file replaced by a directory inherits.
//! Objects with no resolvable label have any host label removed.

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::common::paths::image_path;
use crate::ledger::{Ledgers, INFO_DIR};
use crate::selinux;

pub use crate::ledger::ObjectKind;

/// Mode for new regular files and other non-directories.
pub const NEW_FILE_MODE: u32 = 0o644;

/// Fallbacks when nothing, not even `/`, is recorded.
const ORPHAN_DIR_MODE: u32 = 0o755;

/// Where an assignment came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Exact,
    Inherited { ancestor: String },
    Unrecorded,
}

/// The resolved attributes for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub uid: u32,
    pub gid: u32,
    /// `None` for symlinks; link permissions are never applied.
    pub mode: Option<u32>,
    pub label: Option<String>,
    pub origin: Origin,
}

/// Read-only view of the ledgers answering per-path queries.
pub struct AttributeResolver<'a> {
    ledgers: &'a Ledgers,
}

impl<'a> AttributeResolver<'a> {
    pub fn new(ledgers: &'a Ledgers) -> Self {
        Self { ledgers }
    }

    pub fn resolve(&self, key: &str, kind: ObjectKind) -> Resolution {
        let label = self.resolve_label(key, kind);

        if kind == ObjectKind::Symlink {
            if let Some(link) = self.ledgers.symlinks.get(key) {
                return Resolution {
                    uid: link.uid,
                    gid: link.gid,
                    mode: None,
                    label,
                    origin: Origin::Exact,
                };
            }
        }

        if let Some(record) = self
            .ledgers
            .attributes
            .get(key)
            .filter(|r| r.matches_kind(kind))
        {
            return Resolution {
                uid: record.uid,
                gid: record.gid,
                mode: (kind != ObjectKind::Symlink).then_some(record.mode),
                label,
                origin: Origin::Exact,
            };
        }

        let mode_for = |ancestor_mode: u32| match kind {
            ObjectKind::Directory => Some(ancestor_mode),
            ObjectKind::File => Some(NEW_FILE_MODE),
            ObjectKind::Symlink => None,
        };

        match self.ledgers.attributes.nearest_ancestor(key) {
            Some((ancestor, record)) => Resolution {
                uid: record.uid,
                gid: record.gid,
                mode: mode_for(record.mode),
                label,
                origin: Origin::Inherited {
                    ancestor: ancestor.to_string(),
                },
            },
            None => Resolution {
                uid: 0,
                gid: 0,
                mode: mode_for(ORPHAN_DIR_MODE),
                label,
                origin: Origin::Unrecorded,
            },
        }
    }

    fn resolve_label(&self, key: &str, kind: ObjectKind) -> Option<String> {
        if kind == ObjectKind::Symlink {
            if let Some(label) = self.ledgers.symlinks.get(key).and_then(|l| l.label.clone()) {
                return Some(label);
            }
        }
        if let Some(label) = self.ledgers.labels.get(key) {
            return Some(label.to_string());
        }
        self.ledgers
            .labels
            .nearest_ancestor(key)
            .map(|(_, label)| label.to_string())
    }
}

/// Counters from [`restore_attributes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub exact: usize,
    pub inherited: usize,
    pub labels_applied: usize,
    pub labels_cleared: usize,
    pub label_failures: usize,
}

impl RestoreStats {
    pub fn total(&self) -> usize {
        self.exact + self.inherited
    }
}

/// Apply resolved attributes to every object below `root`.
///
/// Children are handled before their parent so restrictive directory modes
/// never block the walk. The sidecar directory is skipped.
pub fn restore_attributes(root: &Path, ledgers: &Ledgers) -> Result<RestoreStats> {
    let resolver = AttributeResolver::new(ledgers);
    let mut stats = RestoreStats::default();
    let mut first_label_error: Option<String> = None;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .contents_first(true)
        .into_iter()
        .filter_entry(|e| !(e.depth() == 1 && e.file_name() == INFO_DIR));

    for entry in walker {
        crate::interrupt::check()?;
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let path = entry.path();
        let key = image_path(root, path)?;
        let kind = ObjectKind::of(entry.file_type());
        let resolution = resolver.resolve(&key, kind);

        match &resolution.origin {
            Origin::Exact => stats.exact += 1,
            Origin::Inherited { ancestor } => {
                tracing::debug!("{} inherits from {}", key, ancestor);
                stats.inherited += 1;
            }
            Origin::Unrecorded => {
                tracing::debug!("{} has no recorded ancestor", key);
                stats.inherited += 1;
            }
        }

        apply_ownership(path, resolution.uid, resolution.gid)?;
        if let Some(mode) = resolution.mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to chmod {:o} {}", mode, path.display()))?;
        }

        let outcome = match &resolution.label {
            Some(label) => selinux::write_label_xattr(path, label).map(|()| {
                stats.labels_applied += 1;
            }),
            None => selinux::remove_label_xattr(path).map(|removed| {
                if removed {
                    stats.labels_cleared += 1;
                }
            }),
        };
        if let Err(e) = outcome {
            stats.label_failures += 1;
            first_label_error.get_or_insert_with(|| format!("{}: {:#}", key, e));
        }
    }

    if let Some(err) = first_label_error {
        tracing::warn!(
            "{} labels could not be written or cleared (first: {})",
            stats.label_failures,
            err
        );
    }
    Ok(stats)
}

/// `lchown`; never follows a symlink.
fn apply_ownership(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path contains NUL byte: {}", path.display()))?;
    let rc = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to chown {}:{} {}", uid, gid, path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AttributeRecord, SymlinkRecord};

    fn ledgers() -> Ledgers {
        let mut l = Ledgers::default();
        l.attributes.insert("/", AttributeRecord::new(0, 0, 0o755));
        l.attributes.insert("/lib", AttributeRecord::new(0, 2000, 0o751));
        l.attributes
            .insert("/lib/libc.so", AttributeRecord::new(0, 0, 0o644));
        l.labels.insert("/", "u:object_r:rootfs:s0");
        l.labels.insert("/lib", "u:object_r:system_lib_file:s0");
        l.symlinks.insert(
            "/lib/libm.so",
            SymlinkRecord {
                target: "libm.so.6".into(),
                uid: 0,
                gid: 2000,
                mode: 0o777,
                label: Some("u:object_r:link:s0".into()),
            },
        );
        l
    }

    #[test]
    fn exact_match_wins() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/lib/libc.so", ObjectKind::File);
        assert_eq!((r.uid, r.gid, r.mode), (0, 0, Some(0o644)));
        assert_eq!(r.origin, Origin::Exact);
        // label inherited from /lib
        assert_eq!(r.label.as_deref(), Some("u:object_r:system_lib_file:s0"));
    }

    #[test]
    fn new_file_inherits_owner_not_mode() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/lib/newmod.ko", ObjectKind::File);
        assert_eq!((r.uid, r.gid), (0, 2000));
        assert_eq!(r.mode, Some(NEW_FILE_MODE));
        assert_eq!(
            r.origin,
            Origin::Inherited {
                ancestor: "/lib".into()
            }
        );
    }

    #[test]
    fn new_directory_inherits_mode() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/lib/modules/6.1", ObjectKind::Directory);
        assert_eq!(r.mode, Some(0o751));
        assert_eq!(r.gid, 2000);
    }

    #[test]
    fn top_level_file_never_takes_root_mode() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/new.txt", ObjectKind::File);
        assert_eq!((r.uid, r.gid), (0, 0));
        assert_eq!(r.mode, Some(0o644));
        assert_eq!(r.label.as_deref(), Some("u:object_r:rootfs:s0"));
    }

    #[test]
    fn symlink_uses_its_own_ledger() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/lib/libm.so", ObjectKind::Symlink);
        assert_eq!(r.gid, 2000);
        assert_eq!(r.mode, None);
        assert_eq!(r.label.as_deref(), Some("u:object_r:link:s0"));
    }

    #[test]
    fn new_symlink_gets_no_mode() {
        let l = ledgers();
        let r = AttributeResolver::new(&l).resolve("/lib/new_link", ObjectKind::Symlink);
        assert_eq!(r.mode, None);
        assert_eq!(r.gid, 2000);
    }

    #[test]
    fn kind_change_falls_back_to_inheritance() {
        let mut l = ledgers();
        l.attributes.insert(
            "/lib/firmware",
            AttributeRecord::new(0, 0, 0o644).with_kind(ObjectKind::File),
        );
        let r = AttributeResolver::new(&l).resolve("/lib/firmware", ObjectKind::Directory);
        assert_eq!(r.mode, Some(0o751));
        assert_eq!(r.gid, 2000);
        assert_eq!(
            r.origin,
            Origin::Inherited {
                ancestor: "/lib".into()
            }
        );

        let same = AttributeResolver::new(&l).resolve("/lib/firmware", ObjectKind::File);
        assert_eq!(same.origin, Origin::Exact);
        assert_eq!(same.mode, Some(0o644));
    }

    #[test]
    fn empty_ledger_still_assigns() {
        let l = Ledgers::default();
        let r = AttributeResolver::new(&l).resolve("/x", ObjectKind::Directory);
        assert_eq!(r.origin, Origin::Unrecorded);
        assert_eq!(r.mode, Some(0o755));
        assert!(r.label.is_none());
    }
}
