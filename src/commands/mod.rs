//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `unpack` - Extract an image with its attribute ledgers
//! - `repack` - Build an ext4 or EROFS image from an extracted tree
//! - `diff` - Report content changes since extraction
//! - `show` - Display recorded metadata or configuration
//! - `preflight` - Run host checks

mod diff;
mod preflight;
mod repack;
mod show;
mod unpack;

pub use diff::cmd_diff;
pub use preflight::cmd_preflight;
pub use repack::{cmd_repack, RepackArgs};
pub use show::{cmd_show, ShowTarget};
pub use unpack::cmd_unpack;
