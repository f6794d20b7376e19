//! Image reconstruction from an extracted (and possibly edited) tree.
//!
//! - [`resolve`] - Attribute resolution and restoration
//! - [`ext4`] - Strict and flexible ext4 builds
//! - [`erofs`] - Compressed EROFS builds
//!
//! The extracted tree and its ledgers are never modified; every build works
//! on a mount or a scratch copy.

pub mod erofs;
pub mod ext4;
pub mod resolve;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{image_stem, ScratchDir};
use crate::config::Config;
use crate::error::RepackError;
use crate::image::sparse::{self, SparseOutcome};
use crate::image::{FsType, MountMethod};
use crate::ledger::{self, ChecksumBaseline, ImageMetadata, Ledgers, Sidecar, INFO_DIR};
use crate::selinux::EnforcementGuard;
use crate::timing::Timer;

pub use erofs::{Compression, ErofsOptions};
pub use ext4::{Ext4Mode, Ext4Options};
pub use resolve::{restore_attributes, AttributeResolver, RestoreStats};

/// Which image to build.
#[derive(Debug, Clone)]
pub enum Target {
    Ext4(Ext4Options),
    Erofs(ErofsOptions),
}

impl Target {
    pub fn fs_type(&self) -> FsType {
        match self {
            Target::Ext4(_) => FsType::Ext4,
            Target::Erofs(_) => FsType::Erofs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepackOptions {
    pub source: PathBuf,
    pub output: PathBuf,
    pub target: Target,
    pub sparse: bool,
}

/// Everything a builder needs, loaded once at the start of a repack.
pub struct RepackContext<'a> {
    pub config: &'a Config,
    pub source: PathBuf,
    pub ledgers: Ledgers,
    pub baseline: Option<ChecksumBaseline>,
    pub metadata: Option<ImageMetadata>,
    pub scratch: ScratchDir,
}

impl<'a> RepackContext<'a> {
    /// Load the sidecar of `source` and create this run's scratch dir.
    pub fn load(config: &'a Config, source: &Path, output: &Path) -> Result<Self> {
        if !source.is_dir() {
            bail!("{} is not a directory", source.display());
        }
        let sidecar = Sidecar::for_tree(source);
        let ledgers = Ledgers::load(&sidecar)?;
        let baseline = ledger::load_baseline(&sidecar)?;
        let metadata = ledger::load_metadata(&sidecar)?;

        let scratch = ScratchDir::create(
            &config.work_root,
            &format!("repack-{}", image_stem(output)),
        )?;

        Ok(Self {
            config,
            source: source.to_path_buf(),
            ledgers,
            baseline,
            metadata,
            scratch,
        })
    }

    /// Restore attributes on `tree`, then report content changes.
    pub fn restore_and_report(&self, tree: &Path) -> Result<RestoreStats> {
        println!("Restoring attributes...");
        let stats = restore_attributes(tree, &self.ledgers)?;
        println!(
            "  {} objects ({} recorded, {} inherited), {} labels, {} host labels cleared",
            stats.total(),
            stats.exact,
            stats.inherited,
            stats.labels_applied,
            stats.labels_cleared
        );

        match &self.baseline {
            Some(baseline) => {
                println!("Checking for modifications...");
                let current = ChecksumBaseline::compute(tree)?;
                baseline.diff(&current).print();
            }
            None => println!("  No checksum baseline; skipping modification report."),
        }
        Ok(stats)
    }
}

/// Remove the sidecar directory from a tree about to become an image.
pub fn strip_sidecar(tree: &Path) -> Result<()> {
    let info = tree.join(INFO_DIR);
    if info.exists() {
        fs::remove_dir_all(&info)
            .with_context(|| format!("Failed to remove {}", info.display()))?;
    }
    Ok(())
}

/// Reject target/metadata combinations that cannot produce a faithful image.
pub fn check_compatibility(target: &Target, metadata: Option<&ImageMetadata>) -> Result<()> {
    if let Target::Ext4(options) = target {
        if options.mode == Ext4Mode::Strict {
            let metadata = metadata.ok_or_else(|| {
                RepackError::StrictMetadataMissing(format!(
                    "{}/metadata.env not found",
                    INFO_DIR
                ))
            })?;
            if metadata.fs_type != FsType::Ext4 {
                return Err(RepackError::StrictMetadataMissing(format!(
                    "source filesystem was {}, not ext4",
                    metadata.fs_type
                ))
                .into());
            }
            if metadata.ext4.is_none() {
                return Err(RepackError::StrictMetadataMissing(
                    "block size and count were not recorded".to_string(),
                )
                .into());
            }
            if metadata.mount_method == MountMethod::Userspace {
                return Err(RepackError::IncompatibleMountMethod {
                    fs: "strict ext4".to_string(),
                    method: metadata.mount_method.to_string(),
                    reason: "labels were not captured, so the clone would not be faithful"
                        .to_string(),
                }
                .into());
            }
        }
    }

    if let Some(metadata) = metadata {
        if metadata.mount_method == MountMethod::Userspace {
            tracing::warn!(
                "tree was extracted through a user-space mount; labels may be incomplete"
            );
        }
    }
    Ok(())
}

/// Build an image from `options.source`.
pub fn repack(config: &Config, options: &RepackOptions) -> Result<()> {
    let timer = Timer::start("Repack");
    println!(
        "=== Repacking {} as {} ===",
        options.source.display(),
        options.target.fs_type()
    );

    let ctx = RepackContext::load(config, &options.source, &options.output)?;
    check_compatibility(&options.target, ctx.metadata.as_ref())?;
    println!(
        "  Ledgers: {} objects, {} symlinks, {} labels",
        ctx.ledgers.attributes.len(),
        ctx.ledgers.symlinks.len(),
        ctx.ledgers.labels.len()
    );

    if let Some(parent) = options.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let _enforcement = EnforcementGuard::acquire()?;
    match &options.target {
        Target::Ext4(ext4_options) => {
            let outcome = ext4::Ext4Builder::new(&ctx, ext4_options.clone()).build(&options.output)?;
            outcome.print();
        }
        Target::Erofs(erofs_options) => {
            erofs::build(&ctx, erofs_options, &options.output)?;
        }
    }
    crate::interrupt::check()?;

    if options.sparse {
        if let SparseOutcome::KeptRaw(reason) = sparse::package(&options.output) {
            println!("  Kept raw image ({})", reason);
        }
    }

    let size = fs::metadata(&options.output)
        .with_context(|| format!("Output missing: {}", options.output.display()))?
        .len();
    println!();
    println!("Image: {} ({} MB)", options.output.display(), size / 1024 / 1024);
    timer.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ext4info::Ext4Geometry;
    use crate::repack::ext4::sizing::OverheadPercent;

    fn strict() -> Target {
        Target::Ext4(Ext4Options {
            mode: Ext4Mode::Strict,
            overhead: OverheadPercent::MEDIUM,
        })
    }

    fn metadata(fs_type: FsType, method: MountMethod, with_geometry: bool) -> ImageMetadata {
        ImageMetadata {
            source_image: PathBuf::from("system.img"),
            fs_type,
            mount_method: method,
            uuid: None,
            volume_label: None,
            ext4: with_geometry.then(|| Ext4Geometry {
                block_size: 4096,
                block_count: 1024,
                inode_size: 256,
                inode_count: 256,
                uuid: None,
                volume_label: None,
                features: vec!["extent".into()],
                reserved_percent: 0.0,
            }),
        }
    }

    fn strict_missing(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<RepackError>(),
            Some(RepackError::StrictMetadataMissing(_))
        )
    }

    #[test]
    fn strict_requires_metadata() {
        let err = check_compatibility(&strict(), None).unwrap_err();
        assert!(strict_missing(&err));
    }

    #[test]
    fn strict_requires_ext4_geometry() {
        let meta = metadata(FsType::Ext4, MountMethod::Kernel, false);
        assert!(strict_missing(&check_compatibility(&strict(), Some(&meta)).unwrap_err()));

        let meta = metadata(FsType::Erofs, MountMethod::Kernel, false);
        assert!(strict_missing(&check_compatibility(&strict(), Some(&meta)).unwrap_err()));
    }

    #[test]
    fn strict_rejects_userspace_extraction() {
        let meta = metadata(FsType::Ext4, MountMethod::Userspace, true);
        let err = check_compatibility(&strict(), Some(&meta)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RepackError>(),
            Some(RepackError::IncompatibleMountMethod { .. })
        ));
    }

    #[test]
    fn flexible_and_erofs_need_nothing() {
        let flexible = Target::Ext4(Ext4Options {
            mode: Ext4Mode::Flexible,
            overhead: OverheadPercent::SMALL,
        });
        assert!(check_compatibility(&flexible, None).is_ok());
        let erofs = Target::Erofs(ErofsOptions::default());
        let meta = metadata(FsType::Ext4, MountMethod::Userspace, true);
        assert!(check_compatibility(&erofs, Some(&meta)).is_ok());
    }

    #[test]
    fn strict_accepts_kernel_ext4() {
        let meta = metadata(FsType::Ext4, MountMethod::Kernel, true);
        assert!(check_compatibility(&strict(), Some(&meta)).is_ok());
    }
}
