//! EROFS image construction with `mkfs.erofs`.
//!
//! EROFS is built straight from a directory, so the source tree is copied
//! into scratch, restored there and handed to the builder.

use anyhow::{bail, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use super::{strip_sidecar, RepackContext};
use crate::common::copy_tree;
use crate::interrupt;
use crate::process::{self, Cmd};

pub const EROFS_TOOLS: &[(&str, &str)] = &[("mkfs.erofs", "erofs-utils"), ("cp", "coreutils")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Lz4,
    #[default]
    Lz4hc,
    Deflate,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Lz4hc => "lz4hc",
            Compression::Deflate => "deflate",
        }
    }

    /// `(max, default)` for algorithms that take a level.
    fn level_bounds(&self) -> Option<(u32, u32)> {
        match self {
            Compression::Lz4hc => Some((12, 9)),
            Compression::Deflate => Some((9, 1)),
            Compression::None | Compression::Lz4 => None,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "lz4hc" => Ok(Compression::Lz4hc),
            "deflate" => Ok(Compression::Deflate),
            other => bail!(
                "unknown compression '{}' (expected none, lz4, lz4hc or deflate)",
                other
            ),
        }
    }
}

/// The level actually used, and whether the request was overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelChoice {
    pub level: Option<u32>,
    pub fell_back: bool,
}

/// Validate a requested level. Bad values warn and use the default.
pub fn choose_level(compression: Compression, requested: Option<&str>) -> LevelChoice {
    let Some((max, default)) = compression.level_bounds() else {
        if let Some(raw) = requested {
            tracing::warn!("{} takes no level; ignoring '{}'", compression, raw);
        }
        return LevelChoice {
            level: None,
            fell_back: requested.is_some(),
        };
    };

    match requested.map(|raw| (raw, raw.trim().parse::<u32>())) {
        None => LevelChoice {
            level: Some(default),
            fell_back: false,
        },
        Some((_, Ok(level))) if level <= max => LevelChoice {
            level: Some(level),
            fell_back: false,
        },
        Some((raw, _)) => {
            tracing::warn!(
                "{} level '{}' is outside 0-{}; using {}",
                compression,
                raw,
                max,
                default
            );
            LevelChoice {
                level: Some(default),
                fell_back: true,
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErofsOptions {
    pub compression: Compression,
    /// Raw `--level` text; validated at build time.
    pub level: Option<String>,
}

/// Arguments for `mkfs.erofs`, excluding output and source paths.
pub fn mkfs_args(
    compression: Compression,
    level: Option<u32>,
    uuid: Option<&str>,
    label: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["-T0".to_string()];
    match (compression, level) {
        (Compression::None, _) => {}
        (c, Some(level)) => args.push(format!("-z{},{}", c, level)),
        (c, None) => args.push(format!("-z{}", c)),
    }
    if let Some(uuid) = uuid {
        args.push("-U".to_string());
        args.push(uuid.to_string());
    }
    if let Some(label) = label {
        args.push("-L".to_string());
        args.push(label.to_string());
    }
    args
}

/// Copy, restore and build `output`.
pub fn build(ctx: &RepackContext<'_>, options: &ErofsOptions, output: &Path) -> Result<()> {
    process::require_tools(EROFS_TOOLS)?;
    let choice = choose_level(options.compression, options.level.as_deref());

    let tree = ctx.scratch.join("tree");
    fs::create_dir_all(&tree)?;
    println!("Copying tree to scratch...");
    let copy = copy_tree(&ctx.source, &tree)?;
    if !copy.success() {
        bail!(
            "Copy into scratch failed (exit code {}):\n{}",
            copy.code(),
            copy.stderr_trimmed()
        );
    }
    strip_sidecar(&tree)?;
    interrupt::check()?;

    ctx.restore_and_report(&tree)?;
    interrupt::check()?;

    let uuid = ctx.metadata.as_ref().and_then(|m| m.uuid.clone());
    let label = ctx.metadata.as_ref().and_then(|m| m.volume_label.clone());
    match choice.level {
        Some(level) => println!("Building EROFS ({} level {})...", options.compression, level),
        None => println!("Building EROFS ({})...", options.compression),
    }

    if output.exists() {
        fs::remove_file(output)?;
    }
    Cmd::new("mkfs.erofs")
        .args(mkfs_args(
            options.compression,
            choice.level,
            uuid.as_deref(),
            label.as_deref(),
        ))
        .arg_path(output)
        .arg_path(&tree)
        .error_msg("mkfs.erofs failed")
        .run_interactive()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4hc_out_of_range_uses_default() {
        let choice = choose_level(Compression::Lz4hc, Some("99"));
        assert_eq!(choice.level, Some(9));
        assert!(choice.fell_back);
    }

    #[test]
    fn garbage_level_uses_default() {
        let choice = choose_level(Compression::Deflate, Some("fast"));
        assert_eq!(choice.level, Some(1));
        assert!(choice.fell_back);
    }

    #[test]
    fn valid_levels_pass_through() {
        assert_eq!(choose_level(Compression::Lz4hc, Some("12")).level, Some(12));
        assert_eq!(choose_level(Compression::Deflate, Some("0")).level, Some(0));
        assert_eq!(choose_level(Compression::Lz4hc, None).level, Some(9));
        assert!(!choose_level(Compression::Lz4hc, None).fell_back);
    }

    #[test]
    fn levelless_algorithms() {
        assert_eq!(choose_level(Compression::Lz4, None).level, None);
        let ignored = choose_level(Compression::None, Some("3"));
        assert_eq!(ignored.level, None);
        assert!(ignored.fell_back);
    }

    #[test]
    fn args_for_each_compression() {
        assert_eq!(mkfs_args(Compression::None, None, None, None), vec!["-T0"]);
        assert_eq!(
            mkfs_args(Compression::Lz4, None, None, None),
            vec!["-T0", "-zlz4"]
        );
        assert_eq!(
            mkfs_args(Compression::Lz4hc, Some(9), Some("u-1"), Some("vendor")),
            vec!["-T0", "-zlz4hc,9", "-U", "u-1", "-L", "vendor"]
        );
    }

    #[test]
    fn compression_parsing() {
        assert_eq!("LZ4HC".parse::<Compression>().unwrap(), Compression::Lz4hc);
        assert!("zstd".parse::<Compression>().is_err());
    }
}
