#![forbid(unsafe_code)]
//! End-to-end structural coverage: splits, merges, root collapse, cursor
//! traversal, and model-based comparison against a sorted map.
//!
//! Trees are built with a uniform capacity of 4 so a handful of inserts
//! forces real structural churn.

use asupersync::Cx;
use loam_btree::check::{collect_entries, verify_tree};
use loam_btree::{LbaTree, NodeExtentExt, TreeContext, TreeExtent};
use loam_cache::ExtentCache;
use loam_types::{LBA_BLOCK_SIZE, Laddr, LbaValue, NodeMeta, Paddr, TreeShape};
use std::collections::BTreeMap;

fn val(block: u64) -> LbaValue {
    LbaValue::new(Paddr::Absolute(block), 4096)
}

struct Harness {
    cx: Cx,
    cache: ExtentCache<TreeExtent>,
}

impl Harness {
    fn new() -> Self {
        Self {
            cx: Cx::for_testing(),
            cache: ExtentCache::new(LBA_BLOCK_SIZE),
        }
    }

    fn ctx<'a>(&'a self, tx: &'a loam_cache::Transaction<TreeExtent>) -> TreeContext<'a> {
        TreeContext {
            cx: &self.cx,
            cache: &self.cache,
            tx,
        }
    }
}

fn insert_key(tree: &mut LbaTree, ctx: TreeContext<'_>, key: u64) -> bool {
    let hint = tree.lower_bound(ctx, Laddr(key)).expect("lower_bound");
    let (cursor, inserted) = tree
        .insert(ctx, hint, Laddr(key), val(key))
        .expect("insert");
    assert_eq!(cursor.key(), Laddr(key));
    inserted
}

fn remove_key(tree: &mut LbaTree, ctx: TreeContext<'_>, key: u64) {
    let cursor = tree.lower_bound(ctx, Laddr(key)).expect("lower_bound");
    assert!(!cursor.is_end(), "key {key} not present");
    assert_eq!(cursor.key(), Laddr(key));
    tree.remove(ctx, cursor).expect("remove");
}

// ── Root split ──────────────────────────────────────────────────────────

#[test]
fn five_inserts_force_a_root_split() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in 1..=5 {
        assert!(insert_key(&mut tree, ctx, key));
    }

    assert_eq!(tree.root().depth, 2);
    assert!(tree.root_dirty());
    assert_eq!(tx.tree_stats().depth, 2);

    let found = tree.lower_bound(ctx, Laddr(3)).expect("lower_bound");
    assert_eq!(found.key(), Laddr(3));

    // The new root covers the whole space with two children.
    let root_ref = found.internal_extent(2);
    assert_eq!(root_ref.meta(), NodeMeta::new(Laddr::MIN, Laddr::MAX, 2));
    assert_eq!(root_ref.node_size(), 2);
    root_ref.with_internal(|node| assert_eq!(node.first_key(), Laddr::MIN));

    verify_tree(ctx, &tree).expect("verify");
}

#[test]
fn cascading_split_reaches_depth_three() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in 1..=24 {
        insert_key(&mut tree, ctx, key);
        verify_tree(ctx, &tree).expect("verify after insert");
    }

    assert_eq!(tree.root().depth, 3);
    assert_eq!(tx.tree_stats().depth, 3);

    let cursor = tree.begin(ctx).expect("begin");
    let root_ref = cursor.internal_extent(3);
    assert_eq!(root_ref.meta(), NodeMeta::new(Laddr::MIN, Laddr::MAX, 3));
    root_ref.with_internal(|node| assert_eq!(node.first_key(), Laddr::MIN));

    let entries = collect_entries(ctx, &tree).expect("collect");
    let keys: Vec<u64> = entries.iter().map(|(k, _)| k.0).collect();
    assert_eq!(keys, (1..=24).collect::<Vec<_>>());
}

// ── Merge and collapse ──────────────────────────────────────────────────

#[test]
fn removals_cascade_merges_and_collapse_the_root() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in 1..=5 {
        insert_key(&mut tree, ctx, key);
    }
    assert_eq!(tree.root().depth, 2);

    for key in [5, 4, 3, 2] {
        remove_key(&mut tree, ctx, key);
        verify_tree(ctx, &tree).expect("verify after remove");
    }

    assert_eq!(tree.root().depth, 1);
    assert_eq!(tx.tree_stats().depth, 1);
    assert!(tree.root_dirty());

    // The root descriptor now names the surviving leaf directly.
    let cursor = tree.lower_bound(ctx, Laddr::MIN).expect("lower_bound");
    assert_eq!(cursor.key(), Laddr(1));
    assert_eq!(cursor.leaf_extent().paddr(), tree.root().location);
}

#[test]
fn deep_tree_shrinks_back_to_depth_one() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in 1..=24 {
        insert_key(&mut tree, ctx, key);
    }
    assert_eq!(tree.root().depth, 3);

    for key in 1..=24 {
        remove_key(&mut tree, ctx, key);
        verify_tree(ctx, &tree).expect("verify after remove");
    }

    assert_eq!(tree.root().depth, 1);
    let cursor = tree.begin(ctx).expect("begin");
    assert!(cursor.is_end(), "tree must be empty");
}

// ── Cursor traversal ────────────────────────────────────────────────────

#[test]
fn next_crosses_leaf_boundaries_after_a_split() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in [10, 20, 30, 40, 50] {
        insert_key(&mut tree, ctx, key);
    }
    assert_eq!(tree.root().depth, 2);

    // 20 is the last key of the left leaf after the split at 30.
    let cursor = tree.lower_bound(ctx, Laddr(20)).expect("lower_bound");
    assert_eq!(cursor.key(), Laddr(20));
    let next = cursor.next(ctx).expect("next across boundary");
    assert_eq!(next.key(), Laddr(30));
    assert_ne!(
        cursor.leaf_extent().paddr(),
        next.leaf_extent().paddr(),
        "the step must land on the right sibling"
    );

    // And back again.
    let back = next.prev(ctx).expect("prev across boundary");
    assert_eq!(back.key(), Laddr(20));
}

#[test]
fn lower_bound_skips_a_leaf_holding_only_smaller_keys() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in [10, 20, 30, 40, 50] {
        insert_key(&mut tree, ctx, key);
    }
    // Left leaf covers [0, 30) but holds only {10, 20}; the successor of
    // 25 lives at the head of the right sibling.
    let cursor = tree.lower_bound(ctx, Laddr(25)).expect("lower_bound");
    assert!(!cursor.is_end());
    assert_eq!(cursor.key(), Laddr(30));
}

#[test]
fn full_sweep_visits_every_key_in_order() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    let keys: Vec<u64> = (1..=40).map(|i| i * 3).collect();
    for key in &keys {
        insert_key(&mut tree, ctx, *key);
    }

    let entries = collect_entries(ctx, &tree).expect("collect");
    assert_eq!(
        entries.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
        keys,
        "sweep must match insertion set in sorted order"
    );

    // lower_bound then next* equals the flat sorted suffix.
    let mut cursor = tree.lower_bound(ctx, Laddr(50)).expect("lower_bound");
    let mut suffix = Vec::new();
    while !cursor.is_end() {
        suffix.push(cursor.key().0);
        cursor = cursor.next(ctx).expect("next");
    }
    let expected: Vec<u64> = keys.iter().copied().filter(|k| *k >= 50).collect();
    assert_eq!(suffix, expected);
}

// ── Insertion-point normalization ───────────────────────────────────────

#[test]
fn insert_into_the_gap_at_a_leaf_tail() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in [10, 20, 30, 40, 50] {
        insert_key(&mut tree, ctx, key);
    }
    // 25 belongs at the tail of the left leaf; its lower_bound hint sits
    // on the right sibling, so insertion steps back one node.
    assert!(insert_key(&mut tree, ctx, 25));
    verify_tree(ctx, &tree).expect("verify");

    let cursor = tree.lower_bound(ctx, Laddr(25)).expect("lower_bound");
    assert_eq!(cursor.key(), Laddr(25));
    assert_eq!(cursor.value(), val(25));
}

#[test]
fn tail_insert_into_a_full_leaf_splits_and_lands_left_of_the_pivot() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));

    for key in [10, 20, 30, 40, 50, 5, 15] {
        insert_key(&mut tree, ctx, key);
    }
    // The left leaf {5, 10, 15, 20} is full and covers [0, 30); 25 must
    // split it and land at the tail of the new right half.
    assert!(insert_key(&mut tree, ctx, 25));
    verify_tree(ctx, &tree).expect("verify");

    let entries = collect_entries(ctx, &tree).expect("collect");
    assert_eq!(
        entries.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
        vec![5, 10, 15, 20, 25, 30, 40, 50]
    );
}

// ── Model-based comparison ──────────────────────────────────────────────

#[test]
fn tree_tracks_a_sorted_map_through_mixed_churn() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));
    let mut model: BTreeMap<u64, LbaValue> = BTreeMap::new();

    // Deterministic scatter (Weyl sequence) to avoid sorted-insert bias.
    let keys: Vec<u64> = (1_u64..=150)
        .map(|i| (i.wrapping_mul(0x9E37_79B9_7F4A_7C15)) >> 40)
        .collect();

    for key in &keys {
        let inserted = insert_key(&mut tree, ctx, *key);
        let model_new = model.insert(*key, val(*key)).is_none();
        assert_eq!(inserted, model_new, "duplicate handling diverged at {key}");
    }
    verify_tree(ctx, &tree).expect("verify after inserts");

    let entries = collect_entries(ctx, &tree).expect("collect");
    assert_eq!(entries.len(), model.len());
    for ((tree_key, tree_val), (model_key, model_val)) in entries.iter().zip(model.iter()) {
        assert_eq!(tree_key.0, *model_key);
        assert_eq!(tree_val, model_val);
    }

    // Remove every other surviving key.
    let to_remove: Vec<u64> = model.keys().copied().step_by(2).collect();
    for key in &to_remove {
        remove_key(&mut tree, ctx, *key);
        model.remove(key);
        verify_tree(ctx, &tree).expect("verify after remove");
    }

    let entries = collect_entries(ctx, &tree).expect("collect");
    assert_eq!(
        entries.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
        model.keys().copied().collect::<Vec<_>>()
    );

    // insert(k); remove(k) restores the logical content.
    let before = collect_entries(ctx, &tree).expect("collect");
    let probe = 777_777;
    assert!(insert_key(&mut tree, ctx, probe));
    remove_key(&mut tree, ctx, probe);
    let after = collect_entries(ctx, &tree).expect("collect");
    assert_eq!(before, after);
}

// ── Commit visibility ───────────────────────────────────────────────────

#[test]
fn committed_tree_is_readable_from_a_fresh_transaction() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));
    for key in 1..=12 {
        insert_key(&mut tree, ctx, key);
    }
    let root = tree.root();
    h.cache.commit(tx);

    let tx2 = h.cache.begin_transaction();
    let ctx2 = h.ctx(&tx2);
    let reopened = LbaTree::new(root, TreeShape::uniform(4));
    let entries = collect_entries(ctx2, &reopened).expect("collect");
    assert_eq!(
        entries.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
        (1..=12).collect::<Vec<_>>()
    );

    // Reads in the fresh transaction pinned the nodes they traversed.
    assert!(tx2.pinned_extents() > 0);
    let cursor = reopened.begin(ctx2).expect("begin");
    assert!(cursor.leaf_extent().is_linked());

    verify_tree(ctx2, &reopened).expect("verify reopened");
}

#[test]
fn discarded_transaction_leaves_the_committed_tree_intact() {
    let h = Harness::new();
    let tx = h.cache.begin_transaction();
    let ctx = h.ctx(&tx);
    let root = LbaTree::mkfs(ctx, TreeShape::uniform(4));
    let mut tree = LbaTree::new(root, TreeShape::uniform(4));
    for key in 1..=8 {
        insert_key(&mut tree, ctx, key);
    }
    let root = tree.root();
    h.cache.commit(tx);

    // Mutate in a throwaway transaction, then roll it back.
    let tx2 = h.cache.begin_transaction();
    let ctx2 = h.ctx(&tx2);
    let mut scratch = LbaTree::new(root, TreeShape::uniform(4));
    for key in 100..=110 {
        insert_key(&mut scratch, ctx2, key);
    }
    remove_key(&mut scratch, ctx2, 1);
    h.cache.discard(tx2);

    let tx3 = h.cache.begin_transaction();
    let ctx3 = h.ctx(&tx3);
    let reopened = LbaTree::new(root, TreeShape::uniform(4));
    let entries = collect_entries(ctx3, &reopened).expect("collect");
    assert_eq!(
        entries.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
        (1..=8).collect::<Vec<_>>()
    );
}
