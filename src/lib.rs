//! repackfs library exports.
//!
//! The binary is a thin CLI over these modules; integration tests use them
//! directly.

pub mod commands;
pub mod common;
pub mod config;
pub mod error;
pub mod image;
pub mod interrupt;
pub mod ledger;
pub mod preflight;
pub mod process;
pub mod repack;
pub mod selinux;
pub mod timing;
pub mod unpack;
