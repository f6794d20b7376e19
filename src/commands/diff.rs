//! Diff command - reports content changes since extraction.

use anyhow::{bail, Result};
use std::path::Path;

use crate::ledger::{self, ChecksumBaseline, Sidecar};

/// Execute the diff command.
pub fn cmd_diff(dir: &Path) -> Result<()> {
    let sidecar = Sidecar::for_tree(dir);
    let Some(baseline) = ledger::load_baseline(&sidecar)? else {
        bail!(
            "No checksum baseline in {}. Was this directory produced by 'repackfs unpack'?",
            sidecar.dir().display()
        );
    };

    println!("Hashing {}...", dir.display());
    let current = ChecksumBaseline::compute(dir)?;
    baseline.diff(&current).print();
    Ok(())
}
