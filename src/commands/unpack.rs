//! Unpack command - extracts an image into a directory.

use anyhow::Result;
use std::path::PathBuf;

use crate::common::paths::default_destination;
use crate::config::Config;
use crate::unpack::{self, UnpackOptions};

/// Execute the unpack command.
pub fn cmd_unpack(
    config: &Config,
    image: PathBuf,
    destination: Option<PathBuf>,
    force: bool,
) -> Result<()> {
    let destination = destination.unwrap_or_else(|| default_destination(&image));
    let report = unpack::unpack(
        config,
        &UnpackOptions {
            image,
            destination,
            force,
        },
    )?;

    println!();
    println!("Extracted to {}", report.destination.display());
    println!("  Filesystem:   {}", report.metadata.fs_type);
    println!("  Mounted via:  {}", report.metadata.mount_method);
    println!("  Objects:      {}", report.stats.objects);
    println!("  Symlinks:     {}", report.stats.symlinks);
    println!("  Labels:       {}", report.stats.labeled);
    println!("  Files hashed: {}", report.baseline_files);
    Ok(())
}
