//! Structural verification of a live tree.
//!
//! Walks every node and asserts the quantified invariants: child ranges
//! partition the parent range in key order, pivots equal child `begin`s,
//! non-root sizes stay within capacity bounds, all leaves sit at depth 1,
//! and a full left-to-right traversal yields strictly increasing keys.
//!
//! Test support in the spirit of a scrub pass; assertion failures mean
//! the tree (or the mutation that produced it) is corrupt.

use crate::TreeContext;
use crate::cursor::LbaCursor;
use crate::node::NodeExtentExt;
use crate::tree::{LbaTree, get_internal_node, get_leaf_node};
use loam_error::Result;
use loam_types::{Laddr, LbaValue, NodeCapacity, Paddr};

/// Verify every structural invariant, returning the tree's full content
/// in key order.
pub fn verify_tree(ctx: TreeContext<'_>, tree: &LbaTree) -> Result<Vec<(Laddr, LbaValue)>> {
    let root = tree.root();
    let walked = verify_node(
        ctx,
        tree,
        root.depth,
        root.location,
        Laddr::MIN,
        Laddr::MAX,
        true,
    )?;

    // A cursor sweep must observe the same sequence the walk collected.
    let swept = collect_entries(ctx, tree)?;
    assert_eq!(
        walked.len(),
        swept.len(),
        "cursor sweep disagrees with structural walk"
    );
    for (a, b) in walked.iter().zip(swept.iter()) {
        assert_eq!(a, b, "cursor sweep disagrees with structural walk");
    }
    for pair in walked.windows(2) {
        assert!(pair[0].0 < pair[1].0, "leaf keys are not strictly increasing");
    }
    Ok(walked)
}

/// Collect the tree's content through the public cursor interface.
pub fn collect_entries(ctx: TreeContext<'_>, tree: &LbaTree) -> Result<Vec<(Laddr, LbaValue)>> {
    let mut entries = Vec::new();
    let mut cursor: LbaCursor = tree.begin(ctx)?;
    while !cursor.is_end() {
        entries.push((cursor.key(), cursor.value()));
        cursor = cursor.next(ctx)?;
    }
    Ok(entries)
}

fn check_size(size: usize, cap: NodeCapacity, is_root: bool, depth: u8) {
    if is_root {
        if depth > 1 {
            assert!(size >= 2, "internal root with fewer than two children");
        }
    } else {
        assert!(size >= cap.min, "non-root node below minimum capacity");
    }
    assert!(size <= cap.max, "node above maximum capacity");
}

fn verify_node(
    ctx: TreeContext<'_>,
    tree: &LbaTree,
    depth: u8,
    addr: Paddr,
    begin: Laddr,
    end: Laddr,
    is_root: bool,
) -> Result<Vec<(Laddr, LbaValue)>> {
    if depth == 1 {
        let leaf = get_leaf_node(ctx, addr)?;
        return leaf.with_leaf(|node| {
            let meta = node.meta();
            assert_eq!(meta.begin, begin, "leaf begin diverges from parent range");
            assert_eq!(meta.end, end, "leaf end diverges from parent range");
            assert_eq!(meta.depth, 1);
            check_size(node.len(), tree.shape().leaf, is_root, 1);
            let mut entries = Vec::with_capacity(node.len());
            for (key, val) in node.entries() {
                assert!(meta.contains(*key), "leaf key {key} outside {meta}");
                entries.push((*key, *val));
            }
            Ok(entries)
        });
    }

    let internal = get_internal_node(ctx, depth, addr)?;
    let base = internal.paddr();
    let children = internal.with_internal(|node| {
        let meta = node.meta();
        assert_eq!(meta.begin, begin, "node begin diverges from parent range");
        assert_eq!(meta.end, end, "node end diverges from parent range");
        assert_eq!(meta.depth, depth);
        check_size(node.len(), tree.shape().internal, is_root, depth);
        assert_eq!(node.first_key(), begin, "first pivot must equal node begin");

        let mut children = Vec::with_capacity(node.len());
        for idx in 0..node.len() {
            let child_begin = node.key_at(idx);
            let child_end = if idx + 1 < node.len() {
                node.key_at(idx + 1)
            } else {
                meta.end
            };
            assert!(child_begin < child_end, "pivots are not strictly increasing");
            let child_addr = node.child_at(idx).maybe_relative_to(base);
            children.push((child_addr, child_begin, child_end));
        }
        children
    });

    let mut entries = Vec::new();
    for (child_addr, child_begin, child_end) in children {
        entries.extend(verify_node(
            ctx,
            tree,
            depth - 1,
            child_addr,
            child_begin,
            child_end,
            false,
        )?);
    }
    Ok(entries)
}
