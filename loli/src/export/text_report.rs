//! Indented text rendering of call trees and diff reports
//!
//! ```text
//! === LoliProfiler Comparison Report ===
//!
//! Baseline allocations: 5
//! ...
//! === Memory Growth (Delta: Comparison - Baseline) ===
//!
//! main, +11.72 KB, +6
//!     Pool::grow(), +9.77 KB, +5
//! ```
//!
//! Siblings are listed largest first at every level.

use crate::analysis::{CallTree, DiffStats, NodeId, NOISE_FLOOR_BYTES};
use crate::domain::ExportError;
use std::cmp::Reverse;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const KIB: f64 = 1024.0;
const MIB: f64 = KIB * 1024.0;
const GIB: f64 = MIB * 1024.0;

const INDENT: &str = "    ";

/// How tree lines render sizes and counts
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeListing {
    /// Stop below this depth (0 = roots only)
    pub max_depth: Option<usize>,
    /// Prefix non-zero values with `+`/`-`
    pub signed: bool,
}

/// `N Bytes` up to 1 KiB, then KB/MB/GB with two decimals
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn size_to_string(size: u64) -> String {
    let value = size as f64;
    if value >= GIB {
        format!("{:.2} GB", value / GIB)
    } else if value >= MIB {
        format!("{:.2} MB", value / MIB)
    } else if value > KIB {
        format!("{:.2} KB", value / KIB)
    } else {
        format!("{size} Bytes")
    }
}

/// [`size_to_string`] of the magnitude with a `+`/`-` prefix; zero has none
#[must_use]
pub fn signed_size(size: i64) -> String {
    let text = size_to_string(size.unsigned_abs());
    match size.signum() {
        1 => format!("+{text}"),
        -1 => format!("-{text}"),
        _ => text,
    }
}

#[must_use]
pub fn signed_count(count: i64) -> String {
    if count > 0 {
        format!("+{count}")
    } else {
        count.to_string()
    }
}

/// Write every reachable node as `name, size, count`, four spaces per level
pub fn write_tree<W: Write>(
    w: &mut W,
    tree: &CallTree,
    listing: TreeListing,
) -> Result<(), ExportError> {
    let mut stack: Vec<(NodeId, usize)> =
        sorted_by_size(tree, tree.roots()).into_iter().rev().map(|id| (id, 0)).collect();

    while let Some((id, depth)) = stack.pop() {
        let node = tree.node(id);
        let (size, count) = if listing.signed {
            (signed_size(node.size), signed_count(node.count))
        } else {
            (size_to_string(node.size.unsigned_abs()), node.count.to_string())
        };
        writeln!(w, "{}{}, {size}, {count}", INDENT.repeat(depth), node.function_name)?;

        if listing.max_depth.map_or(true, |max| depth < max) {
            let children = sorted_by_size(tree, &node.children);
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
    }
    Ok(())
}

/// Full comparison report: summary header followed by the delta tree
pub fn write_report<W: Write>(
    w: &mut W,
    stats: &DiffStats,
    tree: &CallTree,
) -> Result<(), ExportError> {
    writeln!(w, "=== LoliProfiler Comparison Report ===")?;
    writeln!(w)?;
    writeln!(w, "Baseline allocations: {}", stats.baseline_allocations)?;
    writeln!(w, "Comparison allocations: {}", stats.comparison_allocations)?;
    writeln!(w, "Baseline total size: {}", size_to_string(stats.baseline_total_size.unsigned_abs()))?;
    writeln!(
        w,
        "Comparison total size: {}",
        size_to_string(stats.comparison_total_size.unsigned_abs())
    )?;
    writeln!(w, "Size delta: {}", signed_size(stats.size_delta))?;
    writeln!(w)?;
    writeln!(
        w,
        "Changed allocations (>{}KB growth): {}",
        NOISE_FLOOR_BYTES / 1024,
        stats.changed_allocations
    )?;
    writeln!(w)?;
    writeln!(w, "=== Memory Growth (Delta: Comparison - Baseline) ===")?;
    writeln!(w)?;
    write_tree(w, tree, TreeListing { max_depth: None, signed: true })
}

/// [`write_report`] into a new file at `path`
pub fn save_report(
    path: impl AsRef<Path>,
    stats: &DiffStats,
    tree: &CallTree,
) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_report(&mut writer, stats, tree)?;
    writer.flush()?;
    Ok(())
}

fn sorted_by_size(tree: &CallTree, ids: &[NodeId]) -> Vec<NodeId> {
    let mut sorted = ids.to_vec();
    sorted.sort_by_key(|id| Reverse(tree.node(*id).size));
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::CallTreeNode;

    fn node(name: &str, size: i64, count: i64, hash: u64) -> CallTreeNode {
        CallTreeNode {
            function_name: name.to_string(),
            library_name: "libgame.so".to_string(),
            function_address: hash,
            size,
            count,
            children: Vec::new(),
            parent: None,
            hash,
        }
    }

    fn sample_tree() -> CallTree {
        let mut tree = CallTree::new();
        let root = tree.push_node(node("main", 12_000, 6, 1));
        let small = tree.push_node(node("Small::alloc()", 2_000, 1, 2));
        let large = tree.push_node(node("Pool::grow()", 10_000, 5, 3));
        tree.link(root, small);
        tree.link(root, large);
        tree.add_root(root);
        tree
    }

    fn render(tree: &CallTree, listing: TreeListing) -> String {
        let mut out = Vec::new();
        write_tree(&mut out, tree, listing).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_size_to_string() {
        assert_eq!(size_to_string(0), "0 Bytes");
        assert_eq!(size_to_string(1024), "1024 Bytes");
        assert_eq!(size_to_string(2048), "2.00 KB");
        assert_eq!(size_to_string(3 * 1024 * 1024 / 2), "1.50 MB");
        assert_eq!(size_to_string(1 << 30), "1.00 GB");
    }

    #[test]
    fn test_signed_values() {
        assert_eq!(signed_size(2048), "+2.00 KB");
        assert_eq!(signed_size(-100), "-100 Bytes");
        assert_eq!(signed_size(0), "0 Bytes");
        assert_eq!(signed_count(3), "+3");
        assert_eq!(signed_count(0), "0");
        assert_eq!(signed_count(-2), "-2");
    }

    #[test]
    fn test_children_sorted_by_size() {
        let text = render(&sample_tree(), TreeListing { max_depth: None, signed: true });
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["main, +11.72 KB, +6", "    Pool::grow(), +9.77 KB, +5", "    Small::alloc(), +1.95 KB, +1"]
        );
    }

    #[test]
    fn test_depth_limit_and_unsigned() {
        let text = render(&sample_tree(), TreeListing { max_depth: Some(0), signed: false });
        assert_eq!(text, "main, 11.72 KB, 6\n");
    }

    #[test]
    fn test_report_header() {
        let stats = DiffStats {
            baseline_allocations: 2,
            comparison_allocations: 3,
            baseline_total_size: 2_000,
            comparison_total_size: 14_000,
            size_delta: 12_000,
            changed_allocations: 3,
        };
        let mut out = Vec::new();
        write_report(&mut out, &stats, &sample_tree()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("=== LoliProfiler Comparison Report ===\n\nBaseline allocations: 2\n"));
        assert!(text.contains("Size delta: +11.72 KB\n"));
        assert!(text.contains("Changed allocations (>1KB growth): 3\n"));
        assert!(text.ends_with("    Small::alloc(), +1.95 KB, +1\n"));
    }
}
