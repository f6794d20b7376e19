//! Typed failures that callers branch on.
//!
//! Everything else travels as a plain `anyhow` chain; these variants exist
//! because a builder has to recognise them through `downcast_ref` and react
//! (retry, fall back, or report a specific exit reason).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepackError {
    /// The target filesystem ran out of room during copy or space verification.
    #[error("not enough space in {image}: need {needed} bytes, {available} available")]
    SpaceExhausted {
        image: PathBuf,
        needed: u64,
        available: u64,
    },

    /// Flexible sizing gave up after the bounded number of grow attempts.
    #[error("image still too small after {attempts} attempts (last estimate {last_bytes} bytes)")]
    RetriesExhausted { attempts: u32, last_bytes: u64 },

    #[error("strict mode requires recorded ext4 metadata: {0}")]
    StrictMetadataMissing(String),

    #[error("{fs} repack is incompatible with a tree extracted via {method} mount: {reason}")]
    IncompatibleMountMethod {
        fs: String,
        method: String,
        reason: String,
    },

    #[error("unsupported filesystem '{0}'")]
    UnsupportedFilesystem(String),

    #[error("could not mount {image} (kernel: {kernel}; user-space: {userspace})")]
    Unmountable {
        image: PathBuf,
        kernel: String,
        userspace: String,
    },

    #[error("interrupted")]
    Interrupted,
}

impl RepackError {
    /// True when an error chain bottoms out in a space shortfall.
    pub fn is_space_exhausted(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<RepackError>(),
                Some(RepackError::SpaceExhausted { .. })
            )
        })
    }
}

/// Heuristic over a copy tool's stderr.
pub fn stderr_reports_enospc(stderr: &str) -> bool {
    stderr.contains("No space left on device") || stderr.contains("ENOSPC")
}
