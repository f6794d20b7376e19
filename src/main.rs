//! repackfs - attribute-preserving unpack/repack of Android partition images.
//!
//! Extracts ext4, EROFS and F2FS images into a directory plus ownership,
//! permission and label ledgers, then rebuilds ext4 or EROFS images from the
//! (edited) directory with those attributes replayed.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use repackfs::commands::{self, RepackArgs, ShowTarget};
use repackfs::config::Config;
use repackfs::image::FsType;
use repackfs::interrupt;
use repackfs::repack::ext4::sizing::OverheadPercent;
use repackfs::repack::{Compression, Ext4Mode};

#[derive(Parser)]
#[command(name = "repackfs")]
#[command(about = "Unpack and repack Android filesystem images without losing attributes")]
#[command(
    after_help = "QUICK START:\n  repackfs preflight                        Check host tools\n  repackfs unpack system.img                Extract to ./system\n  repackfs repack system out.img --fs ext4  Rebuild"
)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract an image and record its attributes
    Unpack {
        /// Raw or sparse image
        image: PathBuf,
        /// Destination directory (default: ./<image stem>)
        dest: Option<PathBuf>,
        /// Replace a non-empty destination
        #[arg(long)]
        force: bool,
    },

    /// Build an image from an extracted tree
    Repack {
        /// Directory produced by `unpack`
        source: PathBuf,
        /// Output image path
        output: PathBuf,
        /// Target filesystem
        #[arg(long = "fs", value_enum)]
        fs: BuildFs,
        /// ext4 build mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Flexible-mode overhead percentage (10, 15, 20 or 0-500)
        #[arg(long)]
        overhead: Option<OverheadPercent>,
        /// EROFS compression
        #[arg(long, value_enum)]
        compression: Option<CompressionArg>,
        /// EROFS compression level
        #[arg(long)]
        level: Option<String>,
        /// Convert the result to sparse format
        #[arg(long)]
        sparse: bool,
    },

    /// Report content changes since extraction
    Diff {
        /// Directory produced by `unpack`
        dir: PathBuf,
    },

    /// Show recorded metadata of an extracted tree, or the configuration
    Show {
        /// Directory produced by `unpack`
        dir: Option<PathBuf>,
        /// Show configuration instead
        #[arg(long, conflicts_with = "dir")]
        config: bool,
    },

    /// Run preflight checks (host tools and environment)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum BuildFs {
    Ext4,
    Erofs,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Strict,
    Flexible,
}

#[derive(Clone, Copy, ValueEnum)]
enum CompressionArg {
    None,
    Lz4,
    Lz4hc,
    Deflate,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    interrupt::install();

    if let Err(e) = run(cli) {
        eprintln!("repackfs: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load();

    match cli.command {
        Commands::Unpack { image, dest, force } => {
            commands::cmd_unpack(&config, image, dest, force)?;
        }

        Commands::Repack {
            source,
            output,
            fs,
            mode,
            overhead,
            compression,
            level,
            sparse,
        } => {
            let args = RepackArgs {
                source,
                output,
                fs: match fs {
                    BuildFs::Ext4 => FsType::Ext4,
                    BuildFs::Erofs => FsType::Erofs,
                },
                mode: mode.map(|m| match m {
                    ModeArg::Strict => Ext4Mode::Strict,
                    ModeArg::Flexible => Ext4Mode::Flexible,
                }),
                overhead,
                compression: compression.map(|c| match c {
                    CompressionArg::None => Compression::None,
                    CompressionArg::Lz4 => Compression::Lz4,
                    CompressionArg::Lz4hc => Compression::Lz4hc,
                    CompressionArg::Deflate => Compression::Deflate,
                }),
                level,
                sparse,
            };
            commands::cmd_repack(&config, args)?;
        }

        Commands::Diff { dir } => {
            commands::cmd_diff(&dir)?;
        }

        Commands::Show { dir, config: show_config } => {
            let target = match dir {
                Some(dir) if !show_config => ShowTarget::Tree(dir),
                _ => ShowTarget::Config,
            };
            commands::cmd_show(target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }
    }

    Ok(())
}
