//! ext4 image construction.
//!
//! Both modes share the same population sequence:
//!
//! ```text
//! create file ─► mke2fs ─► mount rw ─► [verify free] ─► cp -a ─► restore
//!      ─► strip sidecar ─► unmount ─► e2fsck ─► [resize2fs -M + truncate]
//! ```
//!
//! Strict clones the recorded geometry and feature set. Flexible sizes the
//! image from the tree and grows it on space exhaustion, at most
//! [`sizing::MAX_ATTEMPTS`] times. A strict build that runs out of space
//! switches to flexible.

pub mod features;
pub mod sizing;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::{strip_sidecar, RepackContext, RestoreStats};
use crate::common::copy_tree;
use crate::error::{stderr_reports_enospc, RepackError};
use crate::image::ext4info::{self, Ext4Geometry};
use crate::image::mount::{Access, Mounter};
use crate::image::{probe, sparse, FsType};
use crate::interrupt;
use crate::process::{self, Cmd};
use features::FeatureDiff;
use sizing::{OverheadPercent, SizeEstimate, TreeStats};

pub const EXT4_TOOLS: &[(&str, &str)] = &[
    ("mke2fs", "e2fsprogs"),
    ("e2fsck", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("dumpe2fs", "e2fsprogs"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("cp", "coreutils"),
];

/// e2fsck exit codes at or above this are real failures.
const FSCK_UNCORRECTED: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext4Mode {
    Strict,
    Flexible,
}

impl fmt::Display for Ext4Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Ext4Mode::Strict => "strict",
            Ext4Mode::Flexible => "flexible",
        })
    }
}

impl FromStr for Ext4Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Ext4Mode::Strict),
            "flexible" => Ok(Ext4Mode::Flexible),
            other => bail!("unknown ext4 mode '{}' (expected strict or flexible)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ext4Options {
    pub mode: Ext4Mode,
    pub overhead: OverheadPercent,
}

/// What a build did.
#[derive(Debug, Clone)]
pub struct Ext4Outcome {
    pub mode: Ext4Mode,
    pub attempts: u32,
    /// Strict ran out of space and flexible took over.
    pub fell_back: bool,
    pub unshared: bool,
    pub shrunk: bool,
    pub restore: RestoreStats,
}

impl Ext4Outcome {
    pub fn print(&self) {
        println!();
        println!("ext4 build summary:");
        println!("  Mode:     {}", self.mode);
        println!("  Attempts: {}", self.attempts);
        if self.fell_back {
            println!("  Fell back from strict after running out of space");
        }
        if self.unshared {
            println!("  Shared blocks were unshared before cloning");
        }
        if self.shrunk {
            println!("  Shrunk to minimum size");
        }
    }
}

/// Drive `attempt` with a growing estimate until it stops failing for space.
///
/// Returns the successful value, the attempt number and the estimate used.
/// Non-space errors end the loop immediately.
pub fn retry_growing<T, F>(initial: SizeEstimate, mut attempt: F) -> Result<(T, u32, SizeEstimate)>
where
    F: FnMut(u32, &SizeEstimate) -> Result<T>,
{
    let mut estimate = initial;
    for n in 1..=sizing::MAX_ATTEMPTS {
        interrupt::check()?;
        match attempt(n, &estimate) {
            Ok(value) => return Ok((value, n, estimate)),
            Err(e) if RepackError::is_space_exhausted(&e) => {
                tracing::warn!("attempt {} ran out of space: {:#}", n, e);
                if n < sizing::MAX_ATTEMPTS {
                    estimate = estimate.grown();
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(RepackError::RetriesExhausted {
        attempts: sizing::MAX_ATTEMPTS,
        last_bytes: estimate.total_bytes,
    }
    .into())
}

/// Run `mode`. A strict build that fails for space hands over to `flexible`,
/// which is told it is a fallback; any other strict error is returned as is.
pub fn run_mode<T, S, F>(mode: Ext4Mode, strict: S, flexible: F) -> Result<T>
where
    S: FnOnce() -> Result<T>,
    F: FnOnce(bool) -> Result<T>,
{
    match mode {
        Ext4Mode::Flexible => flexible(false),
        Ext4Mode::Strict => match strict() {
            Err(e) if RepackError::is_space_exhausted(&e) => {
                tracing::warn!("strict clone ran out of space, switching to flexible: {:#}", e);
                println!("Strict layout too small for the edited tree; using flexible sizing");
                flexible(true)
            }
            other => other,
        },
    }
}

/// A flexible image is shrunk when any space fallback happened: strict gave
/// up, or the first estimate had to grow.
pub fn shrink_after(fell_back: bool, attempts: u32) -> bool {
    fell_back || attempts > 1
}

/// Arguments after `mke2fs` for a given geometry (without the image path).
fn mke2fs_args(
    geometry: &Ext4Geometry,
    uuid: Option<&str>,
    label: Option<&str>,
    features: Option<&str>,
) -> Vec<String> {
    let mut args = vec![
        "-F".to_string(),
        "-t".to_string(),
        "ext4".to_string(),
        "-b".to_string(),
        geometry.block_size.to_string(),
        "-I".to_string(),
        geometry.inode_size.to_string(),
        "-m".to_string(),
        geometry.reserved_percent.to_string(),
    ];
    if geometry.inode_count > 0 {
        args.push("-N".to_string());
        args.push(geometry.inode_count.to_string());
    }
    if let Some(uuid) = uuid {
        args.push("-U".to_string());
        args.push(uuid.to_string());
    }
    if let Some(label) = label {
        args.push("-L".to_string());
        args.push(label.to_string());
    }
    if let Some(features) = features {
        args.push("-O".to_string());
        args.push(features.to_string());
    }
    args
}

pub struct Ext4Builder<'c, 'a> {
    ctx: &'c RepackContext<'a>,
    options: Ext4Options,
    mounter: Mounter,
}

impl<'c, 'a> Ext4Builder<'c, 'a> {
    pub fn new(ctx: &'c RepackContext<'a>, options: Ext4Options) -> Self {
        Self {
            mounter: Mounter::new(ctx.config),
            ctx,
            options,
        }
    }

    pub fn build(&self, output: &Path) -> Result<Ext4Outcome> {
        process::require_tools(EXT4_TOOLS)?;

        run_mode(
            self.options.mode,
            || self.build_strict(output),
            |fell_back| self.build_flexible(output, fell_back),
        )
    }

    fn uuid_and_label(&self, geometry: Option<&Ext4Geometry>) -> (Option<String>, Option<String>) {
        let meta = self.ctx.metadata.as_ref();
        let uuid = meta
            .and_then(|m| m.uuid.clone())
            .or_else(|| geometry.and_then(|g| g.uuid.clone()));
        let label = meta
            .and_then(|m| m.volume_label.clone())
            .or_else(|| geometry.and_then(|g| g.volume_label.clone()));
        (uuid, label)
    }

    fn build_strict(&self, output: &Path) -> Result<Ext4Outcome> {
        println!("Building strict ext4 clone...");
        let recorded = self
            .ctx
            .metadata
            .as_ref()
            .and_then(|m| m.ext4.clone())
            .ok_or_else(|| {
                RepackError::StrictMetadataMissing("block size and count were not recorded".into())
            })?;

        let (geometry, unshared) = if recorded.shared_blocks() {
            (self.unshare_prepass(&recorded)?, true)
        } else {
            (recorded, false)
        };
        interrupt::check()?;

        let defaults = features::probe_defaults(self.ctx.scratch.path(), geometry.block_size)?;
        let diff = FeatureDiff::compute(
            &geometry.features,
            &defaults,
            &self.ctx.config.runtime_features,
        );
        if !diff.is_empty() {
            println!("  Feature changes: {}", diff.to_option().unwrap_or_default());
        }

        let (uuid, label) = self.uuid_and_label(Some(&geometry));
        println!(
            "  Geometry: {} x {} byte blocks, {} inodes",
            geometry.block_count, geometry.block_size, geometry.inode_count
        );
        create_sized_file(output, geometry.size_bytes())?;
        Cmd::new("mke2fs")
            .args(mke2fs_args(
                &geometry,
                uuid.as_deref(),
                label.as_deref(),
                diff.to_option().as_deref(),
            ))
            .arg_path(output)
            .arg(geometry.block_count.to_string())
            .error_msg("mke2fs failed to create the strict image")
            .run()?;

        let restore = self.populate(output, None)?;
        let shrunk = finalize(output, unshared)?;

        Ok(Ext4Outcome {
            mode: Ext4Mode::Strict,
            attempts: 1,
            fell_back: false,
            unshared,
            shrunk,
            restore,
        })
    }

    /// Copy the source image, grow it and let e2fsck unshare its blocks.
    fn unshare_prepass(&self, recorded: &Ext4Geometry) -> Result<Ext4Geometry> {
        println!("Unsharing deduplicated blocks of the source image...");
        let source = self
            .ctx
            .metadata
            .as_ref()
            .map(|m| m.source_image.clone())
            .unwrap_or_default();
        if !source.is_file() {
            bail!(
                "Source image {} is required to unshare blocks but is missing",
                source.display()
            );
        }

        let work = self.ctx.scratch.join("unshare.img");
        if probe::is_sparse(&source)? {
            sparse::to_raw(&source, &work)?;
        } else {
            fs::copy(&source, &work).with_context(|| {
                format!("Failed to copy {} to {}", source.display(), work.display())
            })?;
        }

        let stats = TreeStats::scan(&self.ctx.source)?;
        let estimate = sizing::estimate(&stats, self.options.overhead);
        let target_bytes = estimate.total_bytes.max(recorded.size_bytes());
        let target_blocks = target_bytes.div_ceil(recorded.block_size);
        OpenOptions::new()
            .write(true)
            .open(&work)
            .and_then(|f| f.set_len(target_blocks * recorded.block_size))
            .with_context(|| format!("Failed to extend {}", work.display()))?;

        Cmd::new("resize2fs")
            .arg("-f")
            .arg_path(&work)
            .arg(target_blocks.to_string())
            .error_msg("resize2fs could not grow the image for unsharing")
            .run()?;

        let fsck = Cmd::new("e2fsck")
            .args(["-fy", "-E", "unshare_blocks"])
            .arg_path(&work)
            .allow_fail()
            .run()?;
        if fsck.code() >= FSCK_UNCORRECTED || fsck.code() < 0 {
            bail!(
                "e2fsck could not unshare blocks (exit code {}):\n{}",
                fsck.code(),
                fsck.stdout_trimmed()
            );
        }

        let geometry = ext4info::read_geometry(&work)?;
        let _ = fs::remove_file(&work);
        println!(
            "  Unshared geometry: {} blocks, features {}",
            geometry.block_count,
            geometry.features.join(",")
        );
        Ok(geometry)
    }

    fn build_flexible(&self, output: &Path, fell_back: bool) -> Result<Ext4Outcome> {
        println!("Building flexible ext4 image (overhead {})...", self.options.overhead);
        let stats = TreeStats::scan(&self.ctx.source)?;
        let initial = sizing::estimate(&stats, self.options.overhead);
        println!(
            "  Content {} MB, {} objects, {} directories",
            stats.content_bytes() / 1024 / 1024,
            stats.objects,
            stats.directories
        );

        let (uuid, label) = self.uuid_and_label(None);
        let (restore, attempts, _) = retry_growing(initial, |n, estimate| {
            println!(
                "  Attempt {}/{}: {} MB, {} inodes",
                n,
                sizing::MAX_ATTEMPTS,
                estimate.total_bytes / 1024 / 1024,
                estimate.inode_count
            );
            let geometry = Ext4Geometry {
                block_size: sizing::BLOCK_SIZE,
                block_count: estimate.blocks(),
                inode_size: 256,
                inode_count: estimate.inode_count,
                uuid: None,
                volume_label: None,
                features: Vec::new(),
                reserved_percent: 0.0,
            };
            create_sized_file(output, estimate.total_bytes)?;
            Cmd::new("mke2fs")
                .args(mke2fs_args(&geometry, uuid.as_deref(), label.as_deref(), None))
                .arg_path(output)
                .arg(geometry.block_count.to_string())
                .error_msg("mke2fs failed to create the flexible image")
                .run()?;
            self.populate(output, Some(sizing::required_free(estimate.content_bytes)))
        })?;

        let shrunk = finalize(output, shrink_after(fell_back, attempts))?;
        Ok(Ext4Outcome {
            mode: Ext4Mode::Flexible,
            attempts,
            fell_back,
            unshared: false,
            shrunk,
            restore,
        })
    }

    /// Mount, copy, restore, strip and unmount. Space problems surface as
    /// [`RepackError::SpaceExhausted`].
    fn populate(&self, output: &Path, required_free: Option<u64>) -> Result<RestoreStats> {
        let mountpoint = self.ctx.scratch.join("mnt");
        let mount = self
            .mounter
            .mount(output, FsType::Ext4, &mountpoint, Access::ReadWrite)?;

        if let Some(needed) = required_free {
            let available = fs2::available_space(mount.path())
                .with_context(|| format!("Failed to query free space on {}", mount.path().display()))?;
            if available < needed {
                return Err(RepackError::SpaceExhausted {
                    image: output.to_path_buf(),
                    needed,
                    available,
                }
                .into());
            }
        }
        interrupt::check()?;

        println!("Copying tree into image...");
        let copy = copy_tree(&self.ctx.source, mount.path())?;
        if !copy.success() {
            if stderr_reports_enospc(&copy.stderr) {
                return Err(RepackError::SpaceExhausted {
                    image: output.to_path_buf(),
                    needed: process::tree_size(&self.ctx.source),
                    available: fs2::available_space(mount.path()).unwrap_or(0),
                }
                .into());
            }
            let log = copy_log_path(output);
            fs::write(&log, &copy.stderr)
                .with_context(|| format!("Failed to write {}", log.display()))?;
            bail!(
                "Copy into {} failed (exit code {}); see {}",
                output.display(),
                copy.code(),
                log.display()
            );
        }
        interrupt::check()?;

        let restore = self.ctx.restore_and_report(mount.path())?;
        strip_sidecar(mount.path())?;
        mount.unmount()?;
        Ok(restore)
    }
}

/// `<output>.copy.log`
pub fn copy_log_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".copy.log");
    output.with_file_name(name)
}

fn create_sized_file(path: &Path, bytes: u64) -> Result<()> {
    File::create(path)
        .and_then(|f| f.set_len(bytes))
        .with_context(|| format!("Failed to create {} ({} bytes)", path.display(), bytes))
}

/// Consistency check, then optionally shrink. Returns whether it shrank.
fn finalize(output: &Path, shrink: bool) -> Result<bool> {
    println!("Checking filesystem...");
    let fsck = Cmd::new("e2fsck").arg("-fy").arg_path(output).allow_fail().run()?;
    match fsck.code() {
        0 => println!("  Clean"),
        1..=3 => println!("  Errors corrected (exit code {})", fsck.code()),
        code => tracing::warn!(
            "e2fsck reported uncorrected problems (exit code {}); image kept:\n{}",
            code,
            fsck.stdout_trimmed()
        ),
    }

    if !shrink {
        return Ok(false);
    }

    println!("Shrinking to minimum size...");
    Cmd::new("resize2fs")
        .arg("-M")
        .arg_path(output)
        .error_msg("resize2fs -M failed")
        .run()?;
    let geometry = ext4info::read_geometry(output)?;
    OpenOptions::new()
        .write(true)
        .open(output)
        .and_then(|f| f.set_len(geometry.size_bytes()))
        .with_context(|| format!("Failed to truncate {}", output.display()))?;
    println!("  {} blocks", geometry.block_count);
    Ok(true)
}
