//! Image extraction: mount, harvest, baseline, copy, record.
//!
//! ```text
//! image ──► [sparse → raw] ──► detect type ──► mount ro
//!                                                 │
//!            harvest ledgers ◄────────────────────┤
//!            checksum baseline ◄──────────────────┤
//!            cp -a  ──► <dest>/ ◄─────────────────┘
//!                          └── .repack_info/
//! ```

pub mod harvest;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::{copy_tree, image_stem, ScratchDir};
use crate::config::Config;
use crate::image::mount::{Access, Mounter};
use crate::image::{ext4info, probe, sparse, FsType};
use crate::interrupt;
use crate::ledger::{self, ChecksumBaseline, ImageMetadata, Sidecar};
use crate::process;
use crate::selinux::EnforcementGuard;
use crate::timing::Timer;

pub use harvest::{default_label_sources, Harvester, HarvestStats, LabelSource};

/// Tools every unpack needs.
pub const UNPACK_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("cp", "coreutils"),
];

/// What an unpack produced.
#[derive(Debug, Clone)]
pub struct UnpackReport {
    pub destination: PathBuf,
    pub metadata: ImageMetadata,
    pub stats: HarvestStats,
    pub baseline_files: usize,
}

/// Options for [`unpack`].
#[derive(Debug, Clone)]
pub struct UnpackOptions {
    pub image: PathBuf,
    pub destination: PathBuf,
    /// Replace a non-empty destination.
    pub force: bool,
}

/// Prepare `dest`: it must be absent or empty unless `force` is set.
fn prepare_destination(dest: &Path, force: bool) -> Result<()> {
    if dest.exists() {
        let non_empty = fs::read_dir(dest)
            .with_context(|| format!("Failed to read {}", dest.display()))?
            .next()
            .is_some();
        if non_empty {
            if !force {
                bail!(
                    "{} is not empty. Use --force to replace it.",
                    dest.display()
                );
            }
            println!("  Removing existing {}", dest.display());
            fs::remove_dir_all(dest)
                .with_context(|| format!("Failed to clear {}", dest.display()))?;
        }
    }
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))
}

/// Extract `options.image` into `options.destination` with its ledgers.
pub fn unpack(config: &Config, options: &UnpackOptions) -> Result<UnpackReport> {
    let timer = Timer::start("Unpack");
    let image = options
        .image
        .canonicalize()
        .with_context(|| format!("Image not found: {}", options.image.display()))?;
    let dest = &options.destination;

    println!("=== Unpacking {} ===", image.display());
    process::require_tools(UNPACK_TOOLS)?;
    prepare_destination(dest, options.force)?;

    let _enforcement = EnforcementGuard::acquire()?;
    let stem = image_stem(&image);
    let scratch = ScratchDir::create(&config.work_root, &format!("unpack-{}", stem))?;

    // 1. Normalize to raw
    let raw = if probe::is_sparse(&image)? {
        let raw = scratch.join(format!("{}.raw.img", stem));
        sparse::to_raw(&image, &raw)?;
        raw
    } else {
        image.clone()
    };
    interrupt::check()?;

    // 2. Detect and mount
    let fs_type = probe::detect_fs_type(&raw)?;
    println!("  Filesystem: {}", fs_type);
    let mounter = Mounter::new(config);
    let mount = mounter.mount(&raw, fs_type, &scratch.join("mnt"), Access::ReadOnly)?;
    let mount_method = mount.method();
    interrupt::check()?;

    // 3. Harvest
    println!("Harvesting attributes...");
    let harvester = Harvester::new(default_label_sources());
    let (ledgers, stats) = harvester.harvest(mount.path())?;
    println!(
        "  {} objects, {} symlinks, {} labels",
        stats.objects, stats.symlinks, stats.labeled
    );
    if stats.skipped_symlinks > 0 {
        tracing::warn!("{} unreadable symlinks were skipped", stats.skipped_symlinks);
    }
    if stats.labeled == 0 {
        tracing::warn!("no security labels were found; repacked images will be unlabeled");
    }
    interrupt::check()?;

    // 4. Baseline
    println!("Hashing file contents...");
    let baseline = ChecksumBaseline::compute(mount.path())?;
    println!("  {} files hashed", baseline.len());
    interrupt::check()?;

    // 5. Extract
    println!("Copying tree to {}...", dest.display());
    let copy = copy_tree(mount.path(), dest)?;
    if !copy.success() {
        bail!(
            "Copy from {} failed (exit code {}):\n{}",
            mount.path().display(),
            copy.code(),
            copy.stderr_trimmed()
        );
    }
    mount.unmount()?;
    interrupt::check()?;

    // 6. Record
    let metadata = read_metadata(&image, &raw, fs_type, mount_method);
    let sidecar = Sidecar::for_tree(dest);
    ledgers.save(&sidecar)?;
    ledger::save_baseline(&sidecar, &baseline)?;
    ledger::save_metadata(&sidecar, &metadata)?;
    println!("  Ledgers written to {}", sidecar.dir().display());

    timer.finish();
    Ok(UnpackReport {
        destination: dest.clone(),
        metadata,
        stats,
        baseline_files: baseline.len(),
    })
}

/// Geometry and identity of the source image. Failures degrade to unknown.
fn read_metadata(
    image: &Path,
    raw: &Path,
    fs_type: FsType,
    mount_method: crate::image::MountMethod,
) -> ImageMetadata {
    let mut metadata = ImageMetadata {
        source_image: image.to_path_buf(),
        fs_type,
        mount_method,
        uuid: None,
        volume_label: None,
        ext4: None,
    };

    match fs_type {
        FsType::Ext4 => match ext4info::read_geometry(raw) {
            Ok(geometry) => {
                metadata.uuid = geometry.uuid.clone();
                metadata.volume_label = geometry.volume_label.clone();
                if geometry.shared_blocks() {
                    println!("  Source uses shared_blocks; strict repack will unshare first");
                }
                metadata.ext4 = Some(geometry);
            }
            Err(e) => tracing::warn!("could not read ext4 geometry: {:#}", e),
        },
        FsType::Erofs => {
            let (uuid, label) = ext4info::read_erofs_identity(raw);
            metadata.uuid = uuid;
            metadata.volume_label = label;
        }
        FsType::F2fs => {}
    }

    metadata
}
