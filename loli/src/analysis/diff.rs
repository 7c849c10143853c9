//! # Profile Diff Engine
//!
//! Computes what grew between a baseline and a comparison capture.
//!
//! ## Algorithm
//!
//! ```text
//! 1. comparison leaf with a baseline node of the same suffix hash:
//!        Δsize = comp.size - base.size, Δcount = comp.count - base.count
//! 2. Δsize < 1 KiB or Δcount <= 0       → zero the leaf (kept for now)
//! 3. leaf without baseline, or non-leaf  → zero
//! 4. drop the baseline tree
//! 5. interior nodes: reset, then re-accumulate from the surviving leaves
//! 6. unlink every node with count == 0; what is left is "changed"
//! ```
//!
//! Only leaves carry a delta; interior sizes are always the sum of the
//! leaves below them.

use super::call_tree::{CallTree, NodeId, TreeOptions};
use crate::capture::store::{AllocationRecord, CallStack, Frame};
use crate::domain::{RecordId, Seq, StringHash};
use crate::snapshot::ProfileSnapshot;
use log::{debug, info};
use loli_common::RecordKind;
use serde::Serialize;

/// Leaf deltas below this many bytes are treated as noise
pub const NOISE_FLOOR_BYTES: i64 = 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub baseline_allocations: usize,
    pub comparison_allocations: usize,
    pub baseline_total_size: i64,
    pub comparison_total_size: i64,
    pub size_delta: i64,
    pub changed_allocations: usize,
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub tree: CallTree,
    pub stats: DiffStats,
}

/// Build both trees with `options` and diff them
#[must_use]
pub fn compare(
    baseline: &ProfileSnapshot,
    comparison: &ProfileSnapshot,
    options: TreeOptions,
) -> DiffResult {
    let (baseline_allocations, baseline_total_size) = totals(baseline, options);
    let (comparison_allocations, comparison_total_size) = totals(comparison, options);

    let baseline_tree = CallTree::build(baseline, options);
    let comparison_tree = CallTree::build(comparison, options);
    debug!(
        "Trees built: baseline {} nodes, comparison {} nodes",
        baseline_tree.len(),
        comparison_tree.len()
    );

    let tree = diff_trees(baseline_tree, comparison_tree);
    let stats = DiffStats {
        baseline_allocations,
        comparison_allocations,
        baseline_total_size,
        comparison_total_size,
        size_delta: comparison_total_size - baseline_total_size,
        changed_allocations: tree.len(),
    };
    info!(
        "Diff: {} changed nodes, size delta {} bytes",
        stats.changed_allocations, stats.size_delta
    );
    DiffResult { tree, stats }
}

/// Records considered by the tree build and their total size
fn totals(snapshot: &ProfileSnapshot, options: TreeOptions) -> (usize, i64) {
    let store = &snapshot.records;
    store
        .records()
        .iter()
        .filter(|record| !options.live_only || store.is_alive(record))
        .fold((0, 0), |(count, size), record| (count + 1, size + record.size))
}

/// Turn `comparison` into a pruned delta tree against `baseline`
#[must_use]
pub fn diff_trees(baseline: CallTree, mut comparison: CallTree) -> CallTree {
    let ids: Vec<NodeId> = comparison.node_ids().collect();
    let mut leaves = Vec::new();

    for id in &ids {
        let node = comparison.node(*id);
        let base = if node.is_leaf() { baseline.find(node.hash) } else { None };
        let (size, count) = match base {
            Some(base) => {
                leaves.push(*id);
                let base = baseline.node(base);
                let delta_size = node.size - base.size;
                let delta_count = node.count - base.count;
                if delta_size < NOISE_FLOOR_BYTES || delta_count <= 0 {
                    (0, 0)
                } else {
                    (delta_size, delta_count)
                }
            }
            None => (0, 0),
        };
        let node = comparison.node_mut(*id);
        node.size = size;
        node.count = count;
    }
    drop(baseline);

    for id in &leaves {
        let (size, count) = {
            let leaf = comparison.node(*id);
            (leaf.size, leaf.count)
        };
        if count == 0 {
            continue;
        }
        let mut current = comparison.node(*id).parent;
        while let Some(parent) = current {
            let node = comparison.node_mut(parent);
            node.size += size;
            node.count += count;
            current = node.parent;
        }
    }

    comparison.retain(|node| node.count > 0);
    comparison
}

/// Synthetic snapshot with one record per surviving leaf of a delta tree.
///
/// Each record's stack is the leaf-to-root path; its size is the leaf's
/// delta. `time` and `addr` are zero since these are not real samples.
#[must_use]
pub fn to_snapshot(tree: &CallTree) -> ProfileSnapshot {
    let mut snapshot = ProfileSnapshot::new();

    for (ordinal, leaf) in tree.leaves().into_iter().enumerate() {
        let stack: CallStack = tree
            .path_to_root(leaf)
            .into_iter()
            .map(|id| {
                let node = tree.node(id);
                let library = snapshot.strings.intern(&node.library_name);
                snapshot.symbols.set(&node.library_name, node.function_address, &node.function_name);
                Frame { library, addr: node.function_address }
            })
            .collect();

        let top = stack.first().copied().unwrap_or(Frame { library: StringHash::EMPTY, addr: 0 });
        let record = AllocationRecord {
            id: RecordId(ordinal as u64),
            seq: Seq(u32::try_from(ordinal).unwrap_or(u32::MAX)),
            time: 0,
            size: tree.node(leaf).size,
            addr: 0,
            kind: RecordKind::StackCaptured,
            library: top.library,
            func_addr: top.addr,
        };
        snapshot.records.push(record, Some(stack));
    }
    snapshot
}
