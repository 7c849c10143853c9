//! Call-tree construction and profile comparison

pub mod call_tree;
pub mod diff;

pub use call_tree::{CallTree, CallTreeNode, NodeId, TreeOptions};
pub use diff::{compare, diff_trees, to_snapshot, DiffResult, DiffStats, NOISE_FLOOR_BYTES};
