//! ext4 feature-set diffing for strict clones.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

use crate::image::ext4info;
use crate::process::Cmd;

pub const JOURNAL_FEATURE: &str = "has_journal";

/// Size of the throw-away image used to probe mke2fs defaults.
const PROBE_IMAGE_BYTES: u64 = 32 * 1024 * 1024;

/// Explicit `-O` changes relative to the builder's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureDiff {
    pub enable: Vec<String>,
    pub disable: Vec<String>,
}

impl FeatureDiff {
    /// enable  = original - default - runtime - {has_journal}
    /// disable = default - original - runtime, plus has_journal when the
    ///           original has no journal
    pub fn compute(original: &[String], default: &[String], runtime: &[String]) -> Self {
        let has = |set: &[String], f: &str| set.iter().any(|x| x == f);
        let mut diff = Self::default();

        for feature in original {
            if feature == JOURNAL_FEATURE || has(default, feature) || has(runtime, feature) {
                continue;
            }
            if !has(&diff.enable, feature) {
                diff.enable.push(feature.clone());
            }
        }

        for feature in default {
            if has(original, feature) || has(runtime, feature) {
                continue;
            }
            if !has(&diff.disable, feature) {
                diff.disable.push(feature.clone());
            }
        }

        if !has(original, JOURNAL_FEATURE) && !has(&diff.disable, JOURNAL_FEATURE) {
            diff.disable.push(JOURNAL_FEATURE.to_string());
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.enable.is_empty() && self.disable.is_empty()
    }

    /// Value for `mke2fs -O`, e.g. `dir_index,^has_journal`.
    pub fn to_option(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .enable
            .iter()
            .cloned()
            .chain(self.disable.iter().map(|f| format!("^{}", f)))
            .collect();
        Some(parts.join(","))
    }
}

/// Features mke2fs turns on by default on this host.
///
/// Formats a throw-away file in `scratch` and reads it back; the answer
/// depends on the host's mke2fs.conf, so it cannot be hard-coded.
pub fn probe_defaults(scratch: &Path, block_size: u64) -> Result<Vec<String>> {
    let probe = scratch.join("feature-probe.img");
    File::create(&probe)
        .and_then(|f| f.set_len(PROBE_IMAGE_BYTES))
        .with_context(|| format!("Failed to create {}", probe.display()))?;

    Cmd::new("mke2fs")
        .args(["-q", "-F", "-t", "ext4", "-b", &block_size.to_string()])
        .arg_path(&probe)
        .error_msg("mke2fs could not format the feature probe image")
        .run()?;

    let geometry = ext4info::read_geometry(&probe)?;
    let _ = std::fs::remove_file(&probe);
    tracing::debug!("mke2fs default features: {}", geometry.features.join(" "));
    Ok(geometry.features)
}
