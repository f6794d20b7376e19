//! Show command - displays recorded metadata or configuration.

use anyhow::Result;
use std::path::PathBuf;

use crate::config::Config;
use crate::ledger::{self, Ledgers, Sidecar};

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Show the ledgers and metadata of an extracted tree
    Tree(PathBuf),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Tree(dir) => {
            let sidecar = Sidecar::for_tree(&dir);
            let ledgers = Ledgers::load(&sidecar)?;
            println!("{}:", dir.display());
            println!("  Attribute records: {}", ledgers.attributes.len());
            println!("  Symlink records:   {}", ledgers.symlinks.len());
            println!("  Label records:     {}", ledgers.labels.len());
            match ledger::load_baseline(&sidecar)? {
                Some(baseline) => println!("  Baseline files:    {}", baseline.len()),
                None => println!("  Baseline files:    (none)"),
            }

            println!();
            match ledger::load_metadata(&sidecar)? {
                Some(metadata) => print!("{}", metadata.to_env_string()),
                None => println!("No metadata recorded; strict ext4 repack unavailable."),
            }
        }
    }
    Ok(())
}
