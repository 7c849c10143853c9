//! Machine-readable diff summary (`loli diff --json`)

use crate::analysis::{CallTree, DiffStats};
use crate::domain::ExportError;
use serde::Serialize;
use std::cmp::Reverse;
use std::io::Write;

/// One grown allocation site with its caller chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrowthSite {
    pub function: String,
    pub library: String,
    pub size: i64,
    pub count: i64,
    /// Callers from the allocation site outward, excluding `function`
    pub callers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffSummary {
    #[serde(flatten)]
    pub stats: DiffStats,
    pub top_growth: Vec<GrowthSite>,
}

impl DiffSummary {
    /// Stats plus the `top` largest leaves of the delta tree
    #[must_use]
    pub fn new(stats: DiffStats, tree: &CallTree, top: usize) -> Self {
        let mut leaves = tree.leaves();
        leaves.sort_by_key(|id| Reverse(tree.node(*id).size));

        let top_growth = leaves
            .into_iter()
            .take(top)
            .map(|leaf| {
                let node = tree.node(leaf);
                let callers = tree
                    .path_to_root(leaf)
                    .into_iter()
                    .skip(1)
                    .map(|id| tree.node(id).function_name.clone())
                    .collect();
                GrowthSite {
                    function: node.function_name.clone(),
                    library: node.library_name.clone(),
                    size: node.size,
                    count: node.count,
                    callers,
                }
            })
            .collect();
        Self { stats, top_growth }
    }

    pub fn write<W: Write>(&self, w: W) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(w, self)?;
        Ok(())
    }
}
