//! Repack command - builds an image from an extracted tree.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::Config;
use crate::image::FsType;
use crate::repack::ext4::sizing::OverheadPercent;
use crate::repack::{
    self, Compression, ErofsOptions, Ext4Mode, Ext4Options, RepackOptions, Target,
};

/// Parsed `repack` arguments.
pub struct RepackArgs {
    pub source: PathBuf,
    pub output: PathBuf,
    pub fs: FsType,
    pub mode: Option<Ext4Mode>,
    pub overhead: Option<OverheadPercent>,
    pub compression: Option<Compression>,
    pub level: Option<String>,
    pub sparse: bool,
}

impl RepackArgs {
    fn into_options(self, config: &Config) -> Result<RepackOptions> {
        let target = match self.fs {
            FsType::Ext4 => {
                if self.compression.is_some() || self.level.is_some() {
                    tracing::warn!("--compression and --level only apply to EROFS; ignored");
                }
                let overhead = match self.overhead {
                    Some(o) => o,
                    None => OverheadPercent::new(config.default_overhead)?,
                };
                Target::Ext4(Ext4Options {
                    mode: self.mode.unwrap_or(Ext4Mode::Flexible),
                    overhead,
                })
            }
            FsType::Erofs => {
                if self.mode.is_some() || self.overhead.is_some() {
                    tracing::warn!("--mode and --overhead only apply to ext4; ignored");
                }
                Target::Erofs(ErofsOptions {
                    compression: self.compression.unwrap_or_default(),
                    level: self.level,
                })
            }
            FsType::F2fs => bail!("F2FS images can be unpacked but not rebuilt"),
        };

        Ok(RepackOptions {
            source: self.source,
            output: self.output,
            target,
            sparse: self.sparse,
        })
    }
}

/// Execute the repack command.
pub fn cmd_repack(config: &Config, args: RepackArgs) -> Result<()> {
    let options = args.into_options(config)?;
    repack::repack(config, &options)
}
