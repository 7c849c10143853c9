//! Snapshot persistence and report export
//!
//! This module provides the `.loli` binary codec and the human/machine
//! readable renderings of a diff: indented text and a JSON summary.

pub mod json_summary;
pub mod loli_format;
pub mod text_report;

pub use json_summary::{DiffSummary, GrowthSite};
pub use loli_format::{load, save, FORMAT_VERSION, MAGIC};
pub use text_report::{save_report, size_to_string, write_report, write_tree, TreeListing};
