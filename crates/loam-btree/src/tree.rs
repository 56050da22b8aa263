//! The LBA tree: search, insert with preemptive split, remove with
//! bottom-up merge and root collapse, rewrite-with-remap, and liveness
//! dispatch for extents surfacing from disk.
//!
//! The tree owns only the root descriptor and its dirty flag. Every node
//! lives in the extent cache; every mutation promotes the touched node to
//! pending through `duplicate_for_write` and refreshes the cursor
//! references pointing at the promoted version.

use crate::TreeContext;
use crate::cursor::{CursorMode, LbaCursor, NodePosition};
use crate::node::{InternalNode, LeafNode, NodeExtentExt, NodeRef, TreeExtent};
use loam_error::Result;
use loam_types::{Laddr, LbaValue, NodeMeta, Paddr, RootDescriptor, TreeShape};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Transactional copy-on-write B+tree over the logical address space.
#[derive(Debug)]
pub struct LbaTree {
    root: RootDescriptor,
    root_dirty: bool,
    shape: TreeShape,
}

impl LbaTree {
    /// Bind a tree object to a persisted root descriptor.
    #[must_use]
    pub fn new(root: RootDescriptor, shape: TreeShape) -> Self {
        Self {
            root,
            root_dirty: false,
            shape,
        }
    }

    /// Create an empty tree: a single leaf covering the whole space.
    ///
    /// The returned descriptor is the caller's to persist.
    pub fn mkfs(ctx: TreeContext<'_>, shape: TreeShape) -> RootDescriptor {
        let meta = NodeMeta::new(Laddr::MIN, Laddr::MAX, 1);
        let leaf = ctx
            .cache
            .alloc_new_extent(ctx.tx, TreeExtent::Leaf(LeafNode::new(meta, shape.leaf)));
        leaf.set_pin_range(meta.begin, meta.end);
        ctx.tx.tree_stats_mut().depth = 1;
        debug!(
            target: "loam::btree",
            event = "mkfs",
            root = %leaf.paddr()
        );
        RootDescriptor::new(leaf.paddr(), 1)
    }

    #[must_use]
    pub fn root(&self) -> RootDescriptor {
        self.root
    }

    /// Whether the root descriptor changed and must be persisted.
    #[must_use]
    pub fn root_dirty(&self) -> bool {
        self.root_dirty
    }

    /// Acknowledge that the caller persisted the root descriptor.
    pub fn reset_root_dirty(&mut self) {
        self.root_dirty = false;
    }

    #[must_use]
    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    /// Cursor at the first element (end if the tree is empty).
    pub fn begin(&self, ctx: TreeContext<'_>) -> Result<LbaCursor> {
        self.lower_bound(ctx, Laddr::MIN)
    }

    // ── Search ──────────────────────────────────────────────────────────

    /// First entry with key >= `key`, or end.
    pub fn lower_bound(&self, ctx: TreeContext<'_>, key: Laddr) -> Result<LbaCursor> {
        self.lower_bound_with_visitor(ctx, key, &mut |_| {})
    }

    /// As [`Self::lower_bound`], reporting every traversed node's
    /// metadata to `visitor` exactly once.
    pub fn lower_bound_with_visitor(
        &self,
        ctx: TreeContext<'_>,
        key: Laddr,
        visitor: &mut dyn FnMut(NodeMeta),
    ) -> Result<LbaCursor> {
        let cursor = self.lookup(
            ctx,
            &|node| {
                let idx = node.upper_bound(key);
                assert!(idx > 0, "internal node whose first pivot exceeds the search key");
                idx - 1
            },
            &|leaf| leaf.lower_bound(key),
            visitor,
        )?;
        trace!(
            target: "loam::btree",
            event = "lower_bound",
            key = %key,
            leaf_pos = cursor.leaf.pos
        );
        // The covering leaf may hold only smaller keys; the true successor
        // then lives at the head of the next leaf.
        let cursor = if cursor.leaf.pos == cursor.leaf.node.node_size() {
            cursor.step_to_next_leaf(ctx, visitor)?
        } else {
            cursor
        };
        cursor.assert_valid();
        debug_assert!(cursor.is_end() || cursor.key() >= key);
        Ok(cursor)
    }

    /// Root-to-leaf descent with per-kind slot pickers.
    fn lookup(
        &self,
        ctx: TreeContext<'_>,
        pick_internal: &dyn Fn(&InternalNode) -> usize,
        pick_leaf: &dyn Fn(&LeafNode) -> usize,
        visitor: &mut dyn FnMut(NodeMeta),
    ) -> Result<LbaCursor> {
        let mut internal = Vec::with_capacity(usize::from(self.root.depth) - 1);
        let mut addr = self.root.location;
        for depth in (2..=self.root.depth).rev() {
            let node = get_internal_node(ctx, depth, addr)?;
            visitor(node.meta());
            let pos = node.with_internal(pick_internal);
            let level = NodePosition::new(node, pos);
            addr = level.child_addr();
            internal.push(level);
        }
        let leaf = get_leaf_node(ctx, addr)?;
        visitor(leaf.meta());
        let pos = leaf.with_leaf(pick_leaf);
        internal.reverse();
        Ok(LbaCursor::new(internal, NodePosition::new(leaf, pos)))
    }

    // ── Insert ──────────────────────────────────────────────────────────

    /// Insert `(key, val)` using `hint` as the search starting point.
    ///
    /// Returns the cursor at the key plus whether an insertion happened;
    /// a preexisting key is reported as `(cursor, false)`, not an error.
    pub fn insert(
        &mut self,
        ctx: TreeContext<'_>,
        hint: LbaCursor,
        key: Laddr,
        val: LbaValue,
    ) -> Result<(LbaCursor, bool)> {
        debug!(
            target: "loam::btree",
            event = "insert",
            key = %key,
            val = %val
        );
        let mut iter = hint;
        self.find_insertion(ctx, key, &mut iter)?;

        if iter.mode == CursorMode::Positioned && !iter.is_end() && iter.key() == key {
            return Ok((iter, false));
        }

        self.handle_split(ctx, &mut iter);
        ensure_pending(ctx, &mut iter.leaf);

        let (idx, exists) = iter.leaf.node.with_leaf(|leaf| {
            let idx = leaf.lower_bound(key);
            (idx, idx < leaf.len() && leaf.key_at(idx) == key)
        });
        iter.leaf.pos = idx;
        iter.mode = CursorMode::Positioned;
        if exists {
            return Ok((iter, false));
        }

        let meta = iter.leaf.node.meta();
        assert!(
            meta.contains(key),
            "insertion leaf {meta} does not cover key {key}"
        );
        iter.leaf.node.with_leaf_mut(|leaf| leaf.insert(idx, key, val));
        Ok((iter, true))
    }

    /// Normalize `iter` onto the leaf slot where `key` belongs.
    ///
    /// May step to the previous leaf and mark the cursor as an insertion
    /// point one past that node's last entry.
    fn find_insertion(
        &self,
        ctx: TreeContext<'_>,
        key: Laddr,
        iter: &mut LbaCursor,
    ) -> Result<()> {
        debug_assert!(iter.is_end() || iter.key() >= key);
        if !iter.is_end() && iter.key() == key {
            return Ok(());
        }
        if iter.leaf.node.meta().begin <= key {
            #[cfg(debug_assertions)]
            if iter.leaf.pos > 0 {
                let prev_key = iter.leaf.node.with_leaf(|leaf| leaf.key_at(iter.leaf.pos - 1));
                debug_assert!(prev_key < key);
            }
            return Ok(());
        }

        assert_eq!(iter.leaf.pos, 0, "cursor past a leaf that cannot hold the key");
        let mut prev = iter.prev(ctx)?;
        debug_assert!(prev.leaf.node.meta().begin <= key);
        debug_assert!(prev.key() < key);
        // One past the previous node's last entry; only insert may
        // consume a cursor in this state.
        prev.leaf.pos += 1;
        debug_assert_eq!(prev.leaf.pos, prev.leaf.node.node_size());
        prev.mode = CursorMode::InsertionPoint;
        *iter = prev;
        Ok(())
    }

    /// Preemptive top-down split of every full node on the cursor's path.
    fn handle_split(&mut self, ctx: TreeContext<'_>, iter: &mut LbaCursor) {
        let mut split_from = iter.check_split();
        debug!(
            target: "loam::btree",
            event = "handle_split",
            split_from,
            depth = iter.depth()
        );

        if split_from == iter.depth() {
            let meta = NodeMeta::new(Laddr::MIN, Laddr::MAX, iter.depth() + 1);
            let mut body = InternalNode::new(meta, self.shape.internal);
            body.insert(0, Laddr::MIN, self.root.location);
            let new_root = ctx
                .cache
                .alloc_new_extent(ctx.tx, TreeExtent::Internal(body));
            new_root.set_pin_range(meta.begin, meta.end);
            iter.internal.push(NodePosition::new(new_root.clone(), 0));

            self.root.location = new_root.paddr();
            self.root.depth = iter.depth();
            ctx.tx.tree_stats_mut().depth = iter.depth();
            self.root_dirty = true;
            debug!(
                target: "loam::btree",
                event = "root_split",
                new_root = %new_root.paddr(),
                new_depth = iter.depth()
            );
        }

        while split_from > 0 {
            {
                let parent = iter.internal_pos_mut(split_from + 1);
                ensure_pending(ctx, parent);
            }
            self.split_level(ctx, iter, split_from);
            split_from -= 1;
        }
    }

    /// Split the node at `level`, rewiring the (pending) parent and the
    /// cursor. A cursor offset equal to the left child's size stays on
    /// the left: the pivot equals the right child's first key, so an
    /// insertion at that boundary belongs at the end of the left node.
    fn split_level(&self, ctx: TreeContext<'_>, iter: &mut LbaCursor, level: u8) {
        let child = if level == 1 {
            iter.leaf.clone()
        } else {
            iter.internal_pos(level).clone()
        };

        let (left_payload, right_payload, pivot, left_size) =
            child.node.with_payload(|payload| match payload {
                TreeExtent::Leaf(node) => {
                    let (left, right, pivot) = node.make_split_children();
                    let left_size = left.len();
                    (
                        TreeExtent::Leaf(left),
                        TreeExtent::Leaf(right),
                        pivot,
                        left_size,
                    )
                }
                TreeExtent::Internal(node) => {
                    let (left, right, pivot) = node.make_split_children();
                    let left_size = left.len();
                    (
                        TreeExtent::Internal(left),
                        TreeExtent::Internal(right),
                        pivot,
                        left_size,
                    )
                }
                TreeExtent::Data(_) => panic!("split of a data extent"),
            });

        let left_meta = left_payload.node_meta().expect("split child is a node");
        let right_meta = right_payload.node_meta().expect("split child is a node");
        let left = ctx.cache.alloc_new_extent(ctx.tx, left_payload);
        left.set_pin_range(left_meta.begin, left_meta.end);
        let right = ctx.cache.alloc_new_extent(ctx.tx, right_payload);
        right.set_pin_range(right_meta.begin, right_meta.end);

        debug!(
            target: "loam::btree",
            event = "split_level",
            level,
            pivot = %pivot,
            old = %child.node.paddr(),
            left = %left.paddr(),
            right = %right.paddr()
        );

        {
            let parent = iter.internal_pos(level + 1);
            debug_assert!(parent.node.is_pending());
            let parent_pos = parent.pos;
            let (left_addr, right_addr) = (left.paddr(), right.paddr());
            parent.node.with_internal_mut(|node| {
                node.update(parent_pos, left_addr);
                node.insert(parent_pos + 1, pivot, right_addr);
            });
        }

        ctx.cache.retire_extent(ctx.tx, &child.node);

        let go_right = child.pos > left_size;
        {
            let slot = child_slot_mut(iter, level);
            if go_right {
                slot.node = right;
                slot.pos = child.pos - left_size;
            } else {
                slot.node = left;
            }
        }
        if go_right {
            iter.internal_pos_mut(level + 1).pos += 1;
        }
    }

    // ── Update / remove ─────────────────────────────────────────────────

    /// Overwrite the value under the cursor. No structural change.
    pub fn update(
        &self,
        ctx: TreeContext<'_>,
        cursor: LbaCursor,
        val: LbaValue,
    ) -> Result<LbaCursor> {
        assert!(!cursor.is_end(), "update at end cursor");
        assert_eq!(cursor.mode(), CursorMode::Positioned);
        debug!(
            target: "loam::btree",
            event = "update",
            key = %cursor.key(),
            val = %val
        );
        let mut iter = cursor;
        ensure_pending(ctx, &mut iter.leaf);
        let pos = iter.leaf.pos;
        iter.leaf.node.with_leaf_mut(|leaf| leaf.update(pos, val));
        Ok(iter)
    }

    /// Remove the element under the cursor, then rebalance bottom-up.
    /// The cursor is consumed; removal invalidates it.
    pub fn remove(&mut self, ctx: TreeContext<'_>, cursor: LbaCursor) -> Result<()> {
        assert!(!cursor.is_end(), "remove at end cursor");
        assert_eq!(cursor.mode(), CursorMode::Positioned);
        debug!(
            target: "loam::btree",
            event = "remove",
            key = %cursor.key()
        );
        let mut iter = cursor;
        ensure_pending(ctx, &mut iter.leaf);
        let pos = iter.leaf.pos;
        iter.leaf.node.with_leaf_mut(|leaf| leaf.remove(pos));
        self.handle_merge(ctx, &mut iter)
    }

    /// Bottom-up rebalance after a removal: merge or balance with a
    /// sibling at every level left at minimum capacity, collapsing the
    /// root when it is reduced to a single child.
    fn handle_merge(&mut self, ctx: TreeContext<'_>, iter: &mut LbaCursor) -> Result<()> {
        if iter.depth() == 1 || !iter.leaf.node.at_min_capacity() {
            trace!(
                target: "loam::btree",
                event = "merge_skip",
                leaf_size = iter.leaf.node.node_size(),
                depth = iter.depth()
            );
            return Ok(());
        }

        let mut to_merge: u8 = 1;
        loop {
            debug!(target: "loam::btree", event = "merge_level", depth = to_merge);
            self.merge_level(ctx, iter, to_merge)?;
            to_merge += 1;

            if to_merge == iter.depth() {
                let root_pos = iter.internal_pos(to_merge).clone();
                if root_pos.node.node_size() == 1 {
                    assert_eq!(root_pos.pos, 0, "size-1 root with a nonzero cursor offset");
                    ctx.cache.retire_extent(ctx.tx, &root_pos.node);
                    self.root.location = root_pos.child_addr();
                    iter.internal.pop();
                    self.root.depth = iter.depth();
                    ctx.tx.tree_stats_mut().depth = iter.depth();
                    self.root_dirty = true;
                    debug!(
                        target: "loam::btree",
                        event = "root_collapse",
                        new_root = %self.root.location,
                        new_depth = self.root.depth
                    );
                }
                return Ok(());
            }
            if !iter.internal_pos(to_merge).node.at_min_capacity() {
                return Ok(());
            }
        }
    }

    /// Merge or balance the node at `depth` with a sibling.
    ///
    /// The donor is the left neighbor only when the node is its parent's
    /// rightmost child. A donor at minimum capacity forces a full merge;
    /// otherwise entries are rebalanced toward the shrunken side.
    fn merge_level(&mut self, ctx: TreeContext<'_>, iter: &mut LbaCursor, depth: u8) -> Result<()> {
        {
            let parent = iter.internal_pos_mut(depth + 1);
            ensure_pending(ctx, parent);
        }
        let parent = iter.internal_pos(depth + 1).clone();
        let parent_size = parent.node.node_size();
        assert!(parent.pos < parent_size);

        let donor_is_left = parent.pos + 1 == parent_size;
        let donor_idx = if donor_is_left {
            parent.pos - 1
        } else {
            parent.pos + 1
        };
        let base = parent.node.paddr();
        let donor_addr = parent
            .node
            .with_internal(|node| node.child_at(donor_idx))
            .maybe_relative_to(base);
        let donor = if depth == 1 {
            get_leaf_node(ctx, donor_addr)?
        } else {
            get_internal_node(ctx, depth, donor_addr)?
        };

        let current = if depth == 1 {
            iter.leaf.clone()
        } else {
            iter.internal_pos(depth).clone()
        };

        let (left, right) = if donor_is_left {
            (donor.clone(), current.node.clone())
        } else {
            (current.node.clone(), donor.clone())
        };
        let (left_idx, right_idx) = if donor_is_left {
            (donor_idx, parent.pos)
        } else {
            (parent.pos, donor_idx)
        };
        let left_size = left.node_size();
        let right_size = right.node_size();

        if donor.at_min_capacity() {
            let merged_payload = merged_payload(&left, &right);
            let meta = merged_payload.node_meta().expect("merge of nodes");
            let merged = ctx.cache.alloc_new_extent(ctx.tx, merged_payload);
            merged.set_pin_range(meta.begin, meta.end);
            debug!(
                target: "loam::btree",
                event = "full_merge",
                depth,
                left = %left.paddr(),
                right = %right.paddr(),
                merged = %merged.paddr()
            );

            let merged_addr = merged.paddr();
            parent.node.with_internal_mut(|node| {
                node.update(left_idx, merged_addr);
                node.remove(right_idx);
            });

            {
                let slot = child_slot_mut(iter, depth);
                slot.node = merged;
                if donor_is_left {
                    slot.pos += right_size;
                }
            }
            if donor_is_left {
                iter.internal_pos_mut(depth + 1).pos -= 1;
            }

            ctx.cache.retire_extent(ctx.tx, &left);
            ctx.cache.retire_extent(ctx.tx, &right);
        } else {
            let (left_payload, right_payload, pivot) =
                balanced_payload(&left, &right, !donor_is_left);
            let left_meta = left_payload.node_meta().expect("balanced node");
            let right_meta = right_payload.node_meta().expect("balanced node");
            let replacement_left = ctx.cache.alloc_new_extent(ctx.tx, left_payload);
            replacement_left.set_pin_range(left_meta.begin, left_meta.end);
            let replacement_right = ctx.cache.alloc_new_extent(ctx.tx, right_payload);
            replacement_right.set_pin_range(right_meta.begin, right_meta.end);
            debug!(
                target: "loam::btree",
                event = "balance",
                depth,
                pivot = %pivot,
                left = %left.paddr(),
                right = %right.paddr(),
                replacement_left = %replacement_left.paddr(),
                replacement_right = %replacement_right.paddr()
            );

            let (left_addr, right_addr) = (replacement_left.paddr(), replacement_right.paddr());
            parent.node.with_internal_mut(|node| {
                node.update(left_idx, left_addr);
                node.replace(right_idx, pivot, right_addr);
            });

            if donor_is_left {
                assert!(parent.pos > 0);
                iter.internal_pos_mut(depth + 1).pos -= 1;
            }

            // Keep the cursor on the same element across redistribution.
            let orig = if donor_is_left {
                left_size + current.pos
            } else {
                current.pos
            };
            let replacement_left_size = replacement_left.node_size();
            if orig < replacement_left_size {
                let slot = child_slot_mut(iter, depth);
                slot.node = replacement_left;
                slot.pos = orig;
            } else {
                iter.internal_pos_mut(depth + 1).pos += 1;
                let slot = child_slot_mut(iter, depth);
                slot.node = replacement_right;
                slot.pos = orig - replacement_left_size;
            }

            ctx.cache.retire_extent(ctx.tx, &left);
            ctx.cache.retire_extent(ctx.tx, &right);
        }
        Ok(())
    }

    // ── Extent liveness and rewrite ─────────────────────────────────────

    /// Bind a block surfacing from disk to its live position, if any.
    ///
    /// A logical data extent is live when the tree still maps its laddr
    /// to its paddr; a node is live when the current descent at its
    /// `meta.begin` lands on this very extent. Dead extents are dropped
    /// from the cache and `None` is returned.
    pub fn init_cached_extent(
        &self,
        ctx: TreeContext<'_>,
        extent: NodeRef,
    ) -> Result<Option<NodeRef>> {
        enum Probe {
            Data(Laddr),
            Internal(NodeMeta),
            Leaf(NodeMeta),
        }
        let probe = extent.with_payload(|payload| match payload {
            TreeExtent::Data(data) => Probe::Data(data.laddr()),
            TreeExtent::Internal(node) => Probe::Internal(node.meta()),
            TreeExtent::Leaf(node) => Probe::Leaf(node.meta()),
        });

        match probe {
            Probe::Data(laddr) => {
                let iter = self.lower_bound(ctx, laddr)?;
                let live =
                    !iter.is_end() && iter.key() == laddr && iter.value().paddr == extent.paddr();
                if live {
                    let val = iter.value();
                    assert_eq!(
                        val.len,
                        extent.length(),
                        "mapping length diverges from extent length at {laddr}"
                    );
                    extent.set_pin_range(laddr, laddr.extent_end(val.len));
                    ctx.tx.add_pin(&extent);
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_live",
                        kind = "data",
                        laddr = %laddr,
                        paddr = %extent.paddr()
                    );
                    Ok(Some(extent))
                } else {
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_dead",
                        kind = "data",
                        laddr = %laddr,
                        paddr = %extent.paddr()
                    );
                    ctx.cache.drop_from_cache(&extent);
                    Ok(None)
                }
            }
            Probe::Internal(meta) => {
                let iter = self.lower_bound(ctx, meta.begin)?;
                // Valid even when the cursor is at end: the stack is
                // fully populated either way.
                let live = meta.depth <= iter.depth()
                    && Arc::ptr_eq(&iter.internal_pos(meta.depth).node, &extent);
                if live {
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_live",
                        kind = "internal",
                        meta = %meta
                    );
                    Ok(Some(extent))
                } else {
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_dead",
                        kind = "internal",
                        meta = %meta
                    );
                    ctx.cache.drop_from_cache(&extent);
                    Ok(None)
                }
            }
            Probe::Leaf(meta) => {
                let iter = self.lower_bound(ctx, meta.begin)?;
                if Arc::ptr_eq(&iter.leaf.node, &extent) {
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_live",
                        kind = "leaf",
                        meta = %meta
                    );
                    Ok(Some(extent))
                } else {
                    debug!(
                        target: "loam::btree",
                        event = "init_extent_dead",
                        kind = "leaf",
                        meta = %meta
                    );
                    ctx.cache.drop_from_cache(&extent);
                    Ok(None)
                }
            }
        }
    }

    /// Relocate a tree node to a new physical address, repointing its
    /// parent entry (or the root descriptor) and retiring the original.
    pub fn rewrite_extent(&mut self, ctx: TreeContext<'_>, extent: NodeRef) -> Result<()> {
        let meta = extent
            .with_payload(TreeExtent::node_meta)
            .unwrap_or_else(|| panic!("rewrite of non-node extent at {}", extent.paddr()));

        let payload = extent.with_payload(Clone::clone);
        let replacement = ctx.cache.alloc_new_extent(ctx.tx, payload);
        replacement.set_pin_range(meta.begin, meta.end);

        // Any embedded block-relative child was staged relative to the
        // old block; absorb the move so it resolves at the new location
        // after commit.
        let old_block = extent
            .paddr()
            .as_absolute()
            .expect("rewritten extent has an absolute address");
        let new_block = replacement
            .paddr()
            .as_absolute()
            .expect("fresh extent has an absolute address");
        #[allow(clippy::cast_possible_wrap)]
        let delta = old_block.wrapping_sub(new_block) as i64;
        replacement.with_payload_mut(|payload| {
            if let TreeExtent::Internal(node) = payload {
                node.resolve_relative_addrs(delta);
            }
        });

        debug!(
            target: "loam::btree",
            event = "rewrite",
            meta = %meta,
            from = %extent.paddr(),
            to = %replacement.paddr()
        );

        self.update_internal_mapping(ctx, meta.depth, meta.begin, extent.paddr(), replacement.paddr())?;
        ctx.cache.retire_extent(ctx.tx, &extent);
        Ok(())
    }

    /// Repoint whichever entry references a rewritten node: the root
    /// descriptor when the node is the root, otherwise its parent's
    /// child entry. Any mismatch means corruption and fails fast.
    fn update_internal_mapping(
        &mut self,
        ctx: TreeContext<'_>,
        depth: u8,
        laddr: Laddr,
        old_addr: Paddr,
        new_addr: Paddr,
    ) -> Result<()> {
        debug!(
            target: "loam::btree",
            event = "update_internal_mapping",
            laddr = %laddr,
            depth,
            old = %old_addr,
            new = %new_addr
        );
        let iter = self.lower_bound(ctx, laddr)?;
        assert!(iter.depth() >= depth);

        if depth == iter.depth() {
            if laddr != Laddr::MIN {
                error!(
                    target: "loam::btree",
                    event = "rewrite_mismatch",
                    laddr = %laddr,
                    "root rewrite with nonzero begin"
                );
                panic!("root rewrite with nonzero begin {laddr}");
            }
            if self.root.location != old_addr {
                error!(
                    target: "loam::btree",
                    event = "rewrite_mismatch",
                    root = %self.root.location,
                    old = %old_addr,
                    "root address does not match rewritten extent"
                );
                panic!(
                    "root address {} does not match rewritten extent {old_addr}",
                    self.root.location
                );
            }
            self.root.location = new_addr;
            self.root_dirty = true;
        } else {
            let parent = iter.internal_pos(depth + 1);
            assert!(parent.pos < parent.node.node_size());
            let (pivot, child) = parent
                .node
                .with_internal(|node| (node.key_at(parent.pos), node.child_at(parent.pos)));
            if pivot != laddr {
                error!(
                    target: "loam::btree",
                    event = "rewrite_mismatch",
                    pivot = %pivot,
                    laddr = %laddr,
                    "parent pivot does not match rewritten extent"
                );
                panic!("parent pivot {pivot} does not match rewritten extent at {laddr}");
            }
            if child != old_addr {
                error!(
                    target: "loam::btree",
                    event = "rewrite_mismatch",
                    child = %child,
                    old = %old_addr,
                    "parent child address does not match rewritten extent"
                );
                panic!("parent child address {child} does not match rewritten extent {old_addr}");
            }
            let parent_pos = parent.pos;
            let mutable = ctx.cache.duplicate_for_write(ctx.tx, &parent.node);
            mutable.with_internal_mut(|node| node.update(parent_pos, new_addr));
            // The cursor still references the replaced parent; it is
            // dropped here and must not be reused.
        }
        Ok(())
    }
}

// ── Node fetch and pin ──────────────────────────────────────────────────────

/// Read an internal node, asserting its self-description, and link it
/// into the transaction's pin set unless it is pending or already linked.
pub(crate) fn get_internal_node(
    ctx: TreeContext<'_>,
    depth: u8,
    addr: Paddr,
) -> Result<NodeRef> {
    trace!(
        target: "loam::btree",
        event = "read_internal",
        depth,
        paddr = %addr
    );
    let extent = ctx.cache.get_extent(ctx.cx, ctx.tx, addr)?;
    let meta = extent.with_payload(|payload| match payload {
        TreeExtent::Internal(node) => {
            let meta = node.meta();
            assert_eq!(
                meta.depth, depth,
                "internal node at {addr} has depth {} where {depth} was expected",
                meta.depth
            );
            if !node.is_empty() {
                assert!(meta.begin <= node.first_key());
                assert!(meta.end > node.last_key());
            }
            meta
        }
        other => panic!(
            "extent at {addr} is {}, expected an internal node",
            other.kind()
        ),
    });
    if !extent.is_pending() && !extent.is_linked() {
        extent.set_pin_range(meta.begin, meta.end);
        ctx.tx.add_pin(&extent);
    }
    Ok(extent)
}

/// Read a leaf node; same contract as [`get_internal_node`].
pub(crate) fn get_leaf_node(ctx: TreeContext<'_>, addr: Paddr) -> Result<NodeRef> {
    trace!(
        target: "loam::btree",
        event = "read_leaf",
        paddr = %addr
    );
    let extent = ctx.cache.get_extent(ctx.cx, ctx.tx, addr)?;
    let meta = extent.with_payload(|payload| match payload {
        TreeExtent::Leaf(node) => {
            let meta = node.meta();
            assert!(meta.is_leaf(), "leaf node at {addr} with depth {}", meta.depth);
            if !node.is_empty() {
                assert!(meta.begin <= node.first_key());
                assert!(meta.end > node.last_key());
            }
            meta
        }
        other => panic!("extent at {addr} is {}, expected a leaf node", other.kind()),
    });
    if !extent.is_pending() && !extent.is_linked() {
        extent.set_pin_range(meta.begin, meta.end);
        ctx.tx.add_pin(&extent);
    }
    Ok(extent)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Promote the node at `pos` to pending, refreshing the cursor reference.
fn ensure_pending(ctx: TreeContext<'_>, pos: &mut NodePosition) {
    if !pos.node.is_pending() {
        pos.node = ctx.cache.duplicate_for_write(ctx.tx, &pos.node);
    }
}

fn child_slot_mut(iter: &mut LbaCursor, level: u8) -> &mut NodePosition {
    if level == 1 {
        &mut iter.leaf
    } else {
        iter.internal_pos_mut(level)
    }
}

fn merged_payload(left: &NodeRef, right: &NodeRef) -> TreeExtent {
    left.with_payload(|l| {
        right.with_payload(|r| match (l, r) {
            (TreeExtent::Leaf(a), TreeExtent::Leaf(b)) => TreeExtent::Leaf(a.make_full_merge(b)),
            (TreeExtent::Internal(a), TreeExtent::Internal(b)) => {
                TreeExtent::Internal(a.make_full_merge(b))
            }
            _ => panic!("sibling node kinds diverge during merge"),
        })
    })
}

fn balanced_payload(
    left: &NodeRef,
    right: &NodeRef,
    prefer_left: bool,
) -> (TreeExtent, TreeExtent, Laddr) {
    left.with_payload(|l| {
        right.with_payload(|r| match (l, r) {
            (TreeExtent::Leaf(a), TreeExtent::Leaf(b)) => {
                let (new_left, new_right, pivot) = a.make_balanced(b, prefer_left);
                (TreeExtent::Leaf(new_left), TreeExtent::Leaf(new_right), pivot)
            }
            (TreeExtent::Internal(a), TreeExtent::Internal(b)) => {
                let (new_left, new_right, pivot) = a.make_balanced(b, prefer_left);
                (
                    TreeExtent::Internal(new_left),
                    TreeExtent::Internal(new_right),
                    pivot,
                )
            }
            _ => panic!("sibling node kinds diverge during balance"),
        })
    })
}
