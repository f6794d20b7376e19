//! Cooperative interruption.
//!
//! SIGINT, SIGTERM and SIGHUP only raise a flag. Pipelines call [`check`]
//! between steps and unwind through `?`, so mount and scratch guards drop
//! normally.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::error::RepackError;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide handler. Safe to call more than once.
pub fn install() {
    let result = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::Relaxed);
    });
    if let Err(e) = result {
        tracing::debug!("interrupt handler not installed: {}", e);
    }
}

/// Bail with [`RepackError::Interrupted`] if a signal arrived.
pub fn check() -> Result<()> {
    if INTERRUPTED.load(Ordering::Relaxed) {
        return Err(RepackError::Interrupted.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHILD_ENV: &str = "REPACKFS_SIGTERM_CHILD";

    #[test]
    fn check_passes_without_signal() {
        assert!(check().is_ok());
    }

    /// Runs in a re-executed copy of this test binary, so the flag and the
    /// handler never leak into the other tests.
    #[test]
    fn sigterm_raises_flag_instead_of_killing() {
        if std::env::var_os(CHILD_ENV).is_some() {
            install();
            unsafe {
                libc::kill(libc::getpid(), libc::SIGTERM);
            }
            for _ in 0..200 {
                if check().is_err() {
                    std::process::exit(0);
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            std::process::exit(3);
        }

        let exe = std::env::current_exe().unwrap();
        let status = std::process::Command::new(exe)
            .args([
                "--exact",
                "interrupt::tests::sigterm_raises_flag_instead_of_killing",
                "--test-threads=1",
            ])
            .env(CHILD_ENV, "1")
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(0), "child status: {:?}", status);
    }
}
