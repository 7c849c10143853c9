//! # Call-Tree Builder
//!
//! Merges leaf-first call stacks into a tree keyed by call-stack suffixes.
//!
//! ## Suffix Hashing
//!
//! For a stack `[f0 (leaf), f1, ..., fn (root)]` the node for frame `i` is
//! identified by a hash of the names `fi..fn`. Hashes are computed from the
//! root inward, each one seeding the next:
//!
//! ```text
//! h(n) = xxh64(name(n), seed = 0)
//! h(i) = xxh64(name(i), seed = h(i+1))
//! ```
//!
//! ## Merging
//!
//! ```text
//!  record A: [f1, f2, f3]         f3 ── f2 ─┬─ f1      f3.size = f2.size = A + B
//!  record B: [g1, f2, f3]                   └─ g1
//! ```
//!
//! Walking a stack from the leaf outward, new nodes are created until a hash
//! that already exists is found. That node and every ancestor absorb the
//! record's size and count, the freshly built chain hangs below it, and the
//! walk stops. A chain that never meets an existing node becomes a new root.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`].

use crate::capture::store::{AllocationRecord, Frame};
use crate::snapshot::ProfileSnapshot;
use std::collections::HashMap;
use std::fmt;
use twox_hash::XxHash64;

/// Handle of a node inside its [`CallTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTreeNode {
    pub function_name: String,
    pub library_name: String,
    pub function_address: u64,
    pub size: i64,
    pub count: i64,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    /// Suffix hash that identifies this node
    pub hash: u64,
}

impl CallTreeNode {
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeOptions {
    /// Outermost frames to ignore; stacks not longer than this are skipped
    pub skip_root_levels: usize,
    /// Only records still allocated at the end of capture
    pub live_only: bool,
}

#[derive(Debug, Default, Clone)]
pub struct CallTree {
    nodes: Vec<CallTreeNode>,
    roots: Vec<NodeId>,
    by_hash: HashMap<u64, NodeId>,
}

/// Suffix hashes of `names`, index-aligned (`hashes[i]` covers `names[i..]`)
#[must_use]
pub fn suffix_hashes<S: AsRef<str>>(names: &[S]) -> Vec<u64> {
    let mut hashes = vec![0u64; names.len()];
    let mut seed = 0u64;
    for (slot, name) in hashes.iter_mut().zip(names).rev() {
        seed = XxHash64::oneshot(seed, name.as_ref().as_bytes());
        *slot = seed;
    }
    hashes
}

impl CallTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from every record of `snapshot` that has a call stack
    #[must_use]
    pub fn build(snapshot: &ProfileSnapshot, options: TreeOptions) -> Self {
        let store = &snapshot.records;
        let mut tree = Self::new();
        let mut frame_names: HashMap<_, String> = HashMap::new();

        for record in store.records() {
            if options.live_only && !store.is_alive(record) {
                continue;
            }
            let Some(stack) = store.call_stack(record.id) else { continue };
            if stack.len() <= options.skip_root_levels {
                continue;
            }
            let frames = &stack[..stack.len() - options.skip_root_levels];
            let names: Vec<String> = frames
                .iter()
                .map(|frame| {
                    frame_names
                        .entry(*frame)
                        .or_insert_with(|| snapshot.function_name(frame))
                        .clone()
                })
                .collect();
            tree.insert_stack(snapshot, record, frames, &names);
        }
        tree
    }

    fn insert_stack(
        &mut self,
        snapshot: &ProfileSnapshot,
        record: &AllocationRecord,
        frames: &[Frame],
        names: &[String],
    ) {
        let hashes = suffix_hashes(names);
        let mut child: Option<NodeId> = None;

        for (i, hash) in hashes.iter().enumerate() {
            if let Some(&existing) = self.by_hash.get(hash) {
                self.add_to_chain(existing, record.size, 1);
                if let Some(child) = child {
                    self.link(existing, child);
                }
                return;
            }

            let frame = &frames[i];
            let id = self.push_node(CallTreeNode {
                function_name: names[i].clone(),
                library_name: snapshot.library_name(frame).to_owned(),
                function_address: frame.addr,
                size: record.size,
                count: 1,
                children: Vec::new(),
                parent: None,
                hash: *hash,
            });
            if let Some(child) = child {
                self.link(id, child);
            }
            child = Some(id);
        }

        if let Some(root) = child {
            self.roots.push(root);
        }
    }

    /// Add a detached node, register its hash, and return its handle
    pub fn push_node(&mut self, node: CallTreeNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.by_hash.insert(node.hash, id);
        self.nodes.push(node);
        id
    }

    /// Make `child` a child of `parent`
    pub fn link(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.0].children.push(child);
        self.nodes[child.0].parent = Some(parent);
    }

    /// Mark a parentless node as a root
    pub fn add_root(&mut self, id: NodeId) {
        self.roots.push(id);
    }

    fn add_to_chain(&mut self, start: NodeId, size: i64, count: i64) {
        let mut current = Some(start);
        while let Some(id) = current {
            let node = &mut self.nodes[id.0];
            node.size += size;
            node.count += count;
            current = node.parent;
        }
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &CallTreeNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut CallTreeNode {
        &mut self.nodes[id.0]
    }

    #[must_use]
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    #[must_use]
    pub fn find(&self, hash: u64) -> Option<NodeId> {
        self.by_hash.get(&hash).copied()
    }

    /// Every registered node, in no particular order
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_hash.values().copied()
    }

    /// Nodes reachable from the roots, depth first, parents before children
    #[must_use]
    pub fn walk(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.by_hash.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        order
    }

    /// Reachable leaves
    #[must_use]
    pub fn leaves(&self) -> Vec<NodeId> {
        self.walk().into_iter().filter(|id| self.node(*id).is_leaf()).collect()
    }

    /// `id` and its ancestors, ending at a root
    #[must_use]
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            path.push(parent);
            current = self.nodes[parent.0].parent;
        }
        path
    }

    /// Unlink every node for which `keep` returns false.
    ///
    /// Returns the number of registered nodes left.
    pub fn retain<F>(&mut self, keep: F) -> usize
    where
        F: Fn(&CallTreeNode) -> bool,
    {
        let removed: Vec<NodeId> =
            self.by_hash.values().copied().filter(|id| !keep(&self.nodes[id.0])).collect();
        for id in &removed {
            let hash = self.nodes[id.0].hash;
            self.by_hash.remove(&hash);
            match self.nodes[id.0].parent {
                Some(parent) => self.nodes[parent.0].children.retain(|child| child != id),
                None => self.roots.retain(|root| root != id),
            }
        }
        self.by_hash.len()
    }

    /// Sum of the root sizes
    #[must_use]
    pub fn total_size(&self) -> i64 {
        self.roots.iter().map(|id| self.node(*id).size).sum()
    }

    #[must_use]
    pub fn total_count(&self) -> i64 {
        self.roots.iter().map(|id| self.node(*id).count).sum()
    }

    /// Number of registered nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::store::CallStack;
    use crate::domain::{RecordId, Seq, StringHash};
    use loli_common::RecordKind;

    fn snapshot_with(stacks: &[(&[&str], i64)]) -> ProfileSnapshot {
        let mut snapshot = ProfileSnapshot::new();
        let library = snapshot.strings.intern("libgame.so");
        let mut addr_of: HashMap<String, u64> = HashMap::new();
        for (n, (names, size)) in stacks.iter().enumerate() {
            let stack: CallStack = names
                .iter()
                .map(|name| {
                    let next = addr_of.len() as u64 + 1;
                    let addr = *addr_of.entry((*name).to_string()).or_insert(next * 0x10);
                    snapshot.symbols.set("libgame.so", addr, name);
                    Frame { library, addr }
                })
                .collect();
            let record = AllocationRecord {
                id: RecordId(n as u64),
                seq: Seq(n as u32),
                time: 0,
                size: *size,
                addr: 0x1000 + n as u64,
                kind: RecordKind::StackCaptured,
                library: StringHash::EMPTY,
                func_addr: 0,
            };
            snapshot.records.push(record, Some(stack));
        }
        snapshot
    }

    fn child_names(tree: &CallTree, id: NodeId) -> Vec<&str> {
        tree.node(id).children.iter().map(|c| tree.node(*c).function_name.as_str()).collect()
    }

    #[test]
    fn test_shared_tail_merges() {
        let snapshot = snapshot_with(&[(&["f1", "f2", "f3"][..], 100), (&["g1", "f2", "f3"][..], 50)]);
        let tree = CallTree::build(&snapshot, TreeOptions::default());

        assert_eq!(tree.roots().len(), 1);
        let root = tree.roots()[0];
        assert_eq!(tree.node(root).function_name, "f3");
        assert_eq!(tree.node(root).size, 150);

        let f2 = tree.node(root).children[0];
        assert_eq!(tree.node(f2).function_name, "f2");
        assert_eq!(tree.node(f2).size, 150);
        assert_eq!(tree.node(f2).count, 2);
        assert_eq!(child_names(&tree, f2), vec!["f1", "g1"]);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_same_stack_accumulates() {
        let snapshot = snapshot_with(&[(&["a", "b"][..], 10), (&["a", "b"][..], 20)]);
        let tree = CallTree::build(&snapshot, TreeOptions::default());
        assert_eq!(tree.len(), 2);
        let leaf = tree.leaves()[0];
        assert_eq!(tree.node(leaf).size, 30);
        assert_eq!(tree.node(leaf).count, 2);
        assert_eq!(tree.total_size(), 30);
    }

    #[test]
    fn test_distinct_roots() {
        let snapshot = snapshot_with(&[(&["a", "main"][..], 1), (&["b", "thread_start"][..], 2)]);
        let tree = CallTree::build(&snapshot, TreeOptions::default());
        assert_eq!(tree.roots().len(), 2);
        assert_eq!(tree.total_size(), 3);
    }

    #[test]
    fn test_skip_root_levels() {
        let snapshot = snapshot_with(&[
            (&["a", "x", "libc_start"][..], 1),
            (&["b", "y", "other_start"][..], 2),
            (&["c"][..], 4),
        ]);
        let options = TreeOptions { skip_root_levels: 1, live_only: false };
        let tree = CallTree::build(&snapshot, options);

        let mut roots: Vec<_> =
            tree.roots().iter().map(|id| tree.node(*id).function_name.clone()).collect();
        roots.sort();
        assert_eq!(roots, vec!["x", "y"]);
        assert_eq!(tree.total_size(), 3);
    }

    #[test]
    fn test_live_only_filters_freed() {
        let mut snapshot = snapshot_with(&[(&["a"][..], 10), (&["a"][..], 20)]);
        let freed_addr = snapshot.records.records()[0].addr;
        snapshot.records.record_free(freed_addr, Seq(5));
        let options = TreeOptions { skip_root_levels: 0, live_only: true };
        assert_eq!(CallTree::build(&snapshot, options).total_size(), 20);
        assert_eq!(CallTree::build(&snapshot, TreeOptions::default()).total_size(), 30);
    }

    #[test]
    fn test_recursion_gets_distinct_nodes() {
        let snapshot = snapshot_with(&[(&["r", "r", "r"][..], 8)]);
        let tree = CallTree::build(&snapshot, TreeOptions::default());
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.walk().len(), 3);
    }

    #[test]
    fn test_suffix_hashes_depend_on_tail() {
        let a = suffix_hashes(&["x", "y", "z"]);
        let b = suffix_hashes(&["w", "y", "z"]);
        assert_ne!(a[0], b[0]);
        assert_eq!(a[1..], b[1..]);
    }

    #[test]
    fn test_retain_unlinks_nodes() {
        let snapshot = snapshot_with(&[(&["f1", "f2"][..], 1), (&["g1", "f2"][..], 2)]);
        let mut tree = CallTree::build(&snapshot, TreeOptions::default());
        let left = tree.retain(|node| node.function_name != "g1");
        assert_eq!(left, 2);
        assert_eq!(child_names(&tree, tree.roots()[0]), vec!["f1"]);
        assert_eq!(tree.path_to_root(tree.leaves()[0]).len(), 2);
    }
}
