//! Preflight checks for repackfs.
//!
//! Reports which operations this host can run. Each operation also checks
//! its own required tools before doing anything.

mod environment;
mod host_tools;
mod types;

use anyhow::{bail, Result};

use crate::config::Config;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config) -> PreflightReport {
    let mut report = PreflightReport::default();

    println!("Running preflight checks...\n");

    let mut unpack = host_tools::check_tools(host_tools::UNPACK_REQUIRED, true);
    unpack.extend(host_tools::check_tools(host_tools::UNPACK_OPTIONAL, false));
    report.push("Unpack", unpack);
    report.push(
        "ext4 repack",
        host_tools::check_tools(host_tools::EXT4_REQUIRED, true),
    );
    report.push(
        "EROFS repack",
        host_tools::check_tools(host_tools::EROFS_REQUIRED, true),
    );
    report.push(
        "Sparse images",
        host_tools::check_tools(host_tools::SPARSE_REQUIRED, true),
    );
    report.push("Environment", environment::check_environment(config));

    report
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &Config) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Fix the issues above first.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
