//! Configuration management for repackfs.
//!
//! Reads configuration from `.env` files and environment variables.
//! Environment variables take precedence over `.env` files. The loaded
//! [`Config`] is passed explicitly to every component that needs it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// ext4 features that only describe runtime state and must never be
/// replayed into mke2fs when cloning geometry.
pub const DEFAULT_RUNTIME_FEATURES: &[&str] = &[
    "needs_recovery",
    "orphan_present",
    "shared_blocks",
    "snapshot_bitmap",
    "mmp",
    "journal_dev",
];

/// Default mount option carrying security labels through a kernel mount.
pub const DEFAULT_KERNEL_LABEL_OPTION: &str = "seclabel";

/// Default flexible-mode overhead percentage.
pub const DEFAULT_OVERHEAD_PERCENT: u32 = 15;

/// repackfs configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root under which per-run mount points and scratch dirs are created.
    pub work_root: PathBuf,
    /// ext4 features excluded from strict-mode feature diffing.
    pub runtime_features: Vec<String>,
    /// Extra `-o` option tried on the first kernel mount attempt.
    pub kernel_label_option: String,
    /// Overhead used when `--overhead` is not given.
    pub default_overhead: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("repackfs"),
            runtime_features: DEFAULT_RUNTIME_FEATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            kernel_label_option: DEFAULT_KERNEL_LABEL_OPTION.to_string(),
            default_overhead: DEFAULT_OVERHEAD_PERCENT,
        }
    }
}

impl Config {
    /// Load configuration from `.env` files and the environment.
    ///
    /// Searches for `.env` in:
    /// 1. `~/.config/repackfs/.env`
    /// 2. The current directory (overrides the user file)
    pub fn load() -> Self {
        let mut env_vars = HashMap::new();

        let mut candidates = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("repackfs/.env"));
        }
        candidates.push(PathBuf::from(".env"));

        for path in candidates {
            read_env_file(&path, &mut env_vars);
        }

        for (key, value) in std::env::vars() {
            env_vars.insert(key, value);
        }

        Self::from_vars(&env_vars)
    }

    /// Build a config from an explicit key/value map (defaults for absent keys).
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let defaults = Self::default();

        let work_root = vars
            .get("REPACKFS_WORK_ROOT")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.work_root);

        let runtime_features = vars
            .get("REPACKFS_RUNTIME_FEATURES")
            .map(|s| parse_list(s))
            .unwrap_or(defaults.runtime_features);

        let kernel_label_option = vars
            .get("REPACKFS_KERNEL_LABEL_OPTION")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.kernel_label_option);

        let default_overhead = match vars.get("REPACKFS_DEFAULT_OVERHEAD") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) => n,
                Err(_) => {
                    tracing::warn!(
                        "REPACKFS_DEFAULT_OVERHEAD='{}' is not a number, using {}",
                        raw,
                        defaults.default_overhead
                    );
                    defaults.default_overhead
                }
            },
            None => defaults.default_overhead,
        };

        Self {
            work_root,
            runtime_features,
            kernel_label_option,
            default_overhead,
        }
    }

    /// Per-run directory under the work root.
    pub fn run_dir(&self, name: &str) -> PathBuf {
        self.work_root.join(name)
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  REPACKFS_WORK_ROOT: {}", self.work_root.display());
        println!(
            "  REPACKFS_RUNTIME_FEATURES: {}",
            self.runtime_features.join(",")
        );
        println!(
            "  REPACKFS_KERNEL_LABEL_OPTION: {}",
            self.kernel_label_option
        );
        println!("  REPACKFS_DEFAULT_OVERHEAD: {}%", self.default_overhead);
    }
}

fn read_env_file(path: &Path, into: &mut HashMap<String, String>) {
    if !path.exists() {
        return;
    }
    match dotenvy::from_path_iter(path) {
        Ok(iter) => {
            for item in iter {
                match item {
                    Ok((key, value)) => {
                        into.insert(key, value);
                    }
                    Err(e) => {
                        tracing::warn!("skipping malformed line in {}: {}", path.display(), e)
                    }
                }
            }
        }
        Err(e) => tracing::warn!("could not read {}: {}", path.display(), e),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_empty() {
        let cfg = Config::from_vars(&HashMap::new());
        assert_eq!(cfg.default_overhead, 15);
        assert!(cfg.runtime_features.iter().any(|f| f == "needs_recovery"));
        assert_eq!(cfg.kernel_label_option, "seclabel");
    }

    #[test]
    fn runtime_features_are_data() {
        let cfg = Config::from_vars(&vars(&[(
            "REPACKFS_RUNTIME_FEATURES",
            "needs_recovery, , custom_flag",
        )]));
        assert_eq!(cfg.runtime_features, vec!["needs_recovery", "custom_flag"]);
    }

    #[test]
    fn bad_overhead_falls_back() {
        let cfg = Config::from_vars(&vars(&[("REPACKFS_DEFAULT_OVERHEAD", "lots")]));
        assert_eq!(cfg.default_overhead, DEFAULT_OVERHEAD_PERCENT);
    }

    #[test]
    fn work_root_override() {
        let cfg = Config::from_vars(&vars(&[("REPACKFS_WORK_ROOT", "/srv/scratch")]));
        assert_eq!(cfg.run_dir("system"), PathBuf::from("/srv/scratch/system"));
    }

    #[test]
    fn env_file_values_are_read() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join(".env");
        std::fs::write(&file, "# comment\nREPACKFS_DEFAULT_OVERHEAD=20\n").unwrap();

        let mut map = HashMap::new();
        read_env_file(&file, &mut map);
        assert_eq!(map.get("REPACKFS_DEFAULT_OVERHEAD").map(String::as_str), Some("20"));
    }
}
