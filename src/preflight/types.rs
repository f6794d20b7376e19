//! Preflight check types and report.

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// Check passed.
    Pass,
    /// Check failed - the operation it belongs to will fail.
    Fail,
    /// Check passed but with a warning.
    Warn,
}

impl CheckResult {
    pub fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: None,
        }
    }

    pub fn pass_with(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Pass,
            details: Some(details.to_string()),
        }
    }

    pub fn fail(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Fail,
            details: Some(details.to_string()),
        }
    }

    pub fn warn(name: &str, details: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warn,
            details: Some(details.to_string()),
        }
    }
}

/// A titled group of checks ("Unpack", "ext4 repack", ...).
#[derive(Debug, Clone)]
pub struct CheckGroup {
    pub title: String,
    pub checks: Vec<CheckResult>,
}

/// Results of all preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub groups: Vec<CheckGroup>,
}

impl PreflightReport {
    pub fn push(&mut self, title: &str, checks: Vec<CheckResult>) {
        self.groups.push(CheckGroup {
            title: title.to_string(),
            checks,
        });
    }

    fn checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.groups.iter().flat_map(|g| g.checks.iter())
    }

    /// Returns true if all checks passed (no failures).
    pub fn all_passed(&self) -> bool {
        !self.checks().any(|c| c.status == CheckStatus::Fail)
    }

    pub fn fail_count(&self) -> usize {
        self.checks()
            .filter(|c| c.status == CheckStatus::Fail)
            .count()
    }

    pub fn warn_count(&self) -> usize {
        self.checks()
            .filter(|c| c.status == CheckStatus::Warn)
            .count()
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        println!("=== Preflight Check Results ===");

        for group in &self.groups {
            println!("\n{}:", group.title);
            for check in &group.checks {
                let (icon, status_str) = match check.status {
                    CheckStatus::Pass => ("✓", "PASS"),
                    CheckStatus::Fail => ("✗", "FAIL"),
                    CheckStatus::Warn => ("⚠", "WARN"),
                };
                print!("  {} [{}] {}", icon, status_str, check.name);
                if let Some(details) = &check.details {
                    println!(": {}", details);
                } else {
                    println!();
                }
            }
        }

        println!();
        let total = self.checks().count();
        let passed = self
            .checks()
            .filter(|c| c.status == CheckStatus::Pass)
            .count();

        println!("Summary: {}/{} passed", passed, total);
        if self.fail_count() > 0 {
            println!("         {} FAILED", self.fail_count());
        }
        if self.warn_count() > 0 {
            println!("         {} warnings", self.warn_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_fail() {
        let mut report = PreflightReport::default();
        report.push(
            "Unpack",
            vec![CheckResult::pass("mount"), CheckResult::warn("getfattr", "missing")],
        );
        assert!(report.all_passed());
        assert_eq!(report.warn_count(), 1);

        report.push("Sparse", vec![CheckResult::fail("simg2img", "missing")]);
        assert!(!report.all_passed());
        assert_eq!(report.fail_count(), 1);
    }
}
