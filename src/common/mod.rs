//! Shared utilities across repackfs modules.

pub mod copy;
pub mod paths;
pub mod temp;

pub use copy::copy_tree;
pub use paths::{image_path, image_stem};
pub use temp::{prepare_work_dir, ScratchDir};
