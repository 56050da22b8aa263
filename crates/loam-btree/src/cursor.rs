//! Tree cursors: a stack of node positions from the root down to a leaf.
//!
//! A cursor names a single logical key (or the end sentinel) and is the
//! unit through which mutations are applied. `next`/`prev` produce new
//! cursors and never mutate structure; crossing a node boundary re-reads
//! the sibling path through the cache and may suspend.

use crate::TreeContext;
use crate::node::{NodeExtentExt, NodeRef};
use crate::tree::{get_internal_node, get_leaf_node};
use loam_error::Result;
use loam_types::{Laddr, LbaValue, NodeMeta, Paddr};

/// One level of a cursor: the node plus an entry offset within it.
#[derive(Debug, Clone)]
pub struct NodePosition {
    pub(crate) node: NodeRef,
    pub(crate) pos: usize,
}

impl NodePosition {
    pub(crate) fn new(node: NodeRef, pos: usize) -> Self {
        Self { node, pos }
    }

    /// Child address at the current offset, resolved against this node.
    pub(crate) fn child_addr(&self) -> Paddr {
        let base = self.node.paddr();
        self.node
            .with_internal(|node| node.child_at(self.pos))
            .maybe_relative_to(base)
    }
}

/// Whether a cursor names an element or a bare insertion slot.
///
/// `find_insertion` may leave the leaf offset one past the node's last
/// entry; that transient state is legal only as input to `insert` and is
/// kept distinct from `end` by this marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    Positioned,
    InsertionPoint,
}

/// Cursor into the tree: internal positions indexed by depth starting at
/// 2 (the root is last), plus the leaf position.
#[derive(Debug, Clone)]
pub struct LbaCursor {
    pub(crate) internal: Vec<NodePosition>,
    pub(crate) leaf: NodePosition,
    pub(crate) mode: CursorMode,
}

/// Which slot a partial re-descend lands on at each level.
#[derive(Debug, Clone, Copy)]
enum DescentSlot {
    First,
    Last,
}

impl LbaCursor {
    pub(crate) fn new(internal: Vec<NodePosition>, leaf: NodePosition) -> Self {
        Self {
            internal,
            leaf,
            mode: CursorMode::Positioned,
        }
    }

    /// Tree depth seen by this cursor (leaves are depth 1).
    #[must_use]
    pub fn depth(&self) -> u8 {
        1 + u8::try_from(self.internal.len()).expect("tree depth fits in u8")
    }

    pub(crate) fn internal_pos(&self, depth: u8) -> &NodePosition {
        &self.internal[usize::from(depth) - 2]
    }

    pub(crate) fn internal_pos_mut(&mut self, depth: u8) -> &mut NodePosition {
        &mut self.internal[usize::from(depth) - 2]
    }

    #[must_use]
    pub fn mode(&self) -> CursorMode {
        self.mode
    }

    /// Past the last element. An insertion-point cursor is never `end`.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.mode == CursorMode::Positioned && self.leaf.pos == self.leaf.node.node_size()
    }

    /// At the first element of the whole tree.
    #[must_use]
    pub fn is_begin(&self) -> bool {
        self.leaf.pos == 0 && self.internal.iter().all(|level| level.pos == 0)
    }

    /// Key under the cursor. The cursor must name an element.
    #[must_use]
    pub fn key(&self) -> Laddr {
        assert_eq!(self.mode, CursorMode::Positioned, "key of insertion-point cursor");
        assert!(!self.is_end(), "key of end cursor");
        self.leaf.node.with_leaf(|leaf| leaf.key_at(self.leaf.pos))
    }

    /// The leaf extent under this cursor.
    ///
    /// Handed to reclamation callers that rewrite nodes or probe
    /// liveness; the reference stays valid until the next mutation.
    #[must_use]
    pub fn leaf_extent(&self) -> NodeRef {
        std::sync::Arc::clone(&self.leaf.node)
    }

    /// The internal-node extent at `depth` (2 ..= `self.depth()`).
    #[must_use]
    pub fn internal_extent(&self, depth: u8) -> NodeRef {
        assert!((2..=self.depth()).contains(&depth), "no internal level {depth}");
        std::sync::Arc::clone(&self.internal_pos(depth).node)
    }

    /// Value under the cursor. The cursor must name an element.
    #[must_use]
    pub fn value(&self) -> LbaValue {
        assert_eq!(self.mode, CursorMode::Positioned, "value of insertion-point cursor");
        assert!(!self.is_end(), "value of end cursor");
        self.leaf.node.with_leaf(|leaf| *leaf.val_at(self.leaf.pos))
    }

    pub(crate) fn assert_valid(&self) {
        debug_assert!(self.leaf.pos <= self.leaf.node.node_size());
        for level in &self.internal {
            debug_assert!(level.pos < level.node.node_size());
        }
        if self.mode == CursorMode::InsertionPoint {
            debug_assert_eq!(self.leaf.pos, self.leaf.node.node_size());
        }
    }

    /// Step to the next element.
    pub fn next(&self, ctx: TreeContext<'_>) -> Result<Self> {
        self.next_with_visitor(ctx, &mut |_| {})
    }

    /// Step to the next element, reporting any newly traversed node.
    pub fn next_with_visitor(
        &self,
        ctx: TreeContext<'_>,
        visitor: &mut dyn FnMut(NodeMeta),
    ) -> Result<Self> {
        assert_eq!(self.mode, CursorMode::Positioned, "next on insertion-point cursor");
        assert!(!self.is_end(), "next on end cursor");
        self.assert_valid();

        if self.leaf.pos + 1 < self.leaf.node.node_size() {
            let mut ret = self.clone();
            ret.leaf.pos += 1;
            return Ok(ret);
        }
        self.step_to_next_leaf(ctx, visitor)
    }

    /// Step to the previous element. Requires `!is_begin()`; stepping back
    /// from `end` lands on the last element.
    pub fn prev(&self, ctx: TreeContext<'_>) -> Result<Self> {
        assert_eq!(self.mode, CursorMode::Positioned, "prev on insertion-point cursor");
        assert!(!self.is_begin(), "prev on begin cursor");
        self.assert_valid();

        let mut ret = self.clone();
        if ret.leaf.pos > 0 {
            ret.leaf.pos -= 1;
            return Ok(ret);
        }

        let mut depth_with_space = None;
        for depth in 2..=self.depth() {
            if self.internal_pos(depth).pos > 0 {
                depth_with_space = Some(depth);
                break;
            }
        }
        let depth_with_space = depth_with_space.expect("cursor is not begin");

        ret.internal_pos_mut(depth_with_space).pos -= 1;
        descend_from(ctx, &mut ret, depth_with_space - 1, DescentSlot::Last, &mut |_| {})?;
        Ok(ret)
    }

    /// Cross the right leaf boundary: advance the nearest ancestor with a
    /// following entry and re-descend along its leftmost path. With no
    /// such ancestor the result is the end cursor.
    pub(crate) fn step_to_next_leaf(
        &self,
        ctx: TreeContext<'_>,
        visitor: &mut dyn FnMut(NodeMeta),
    ) -> Result<Self> {
        let mut depth_with_space = None;
        for depth in 2..=self.depth() {
            let level = self.internal_pos(depth);
            if level.pos + 1 < level.node.node_size() {
                depth_with_space = Some(depth);
                break;
            }
        }

        let mut ret = self.clone();
        ret.mode = CursorMode::Positioned;
        match depth_with_space {
            None => {
                ret.leaf.pos = ret.leaf.node.node_size();
                Ok(ret)
            }
            Some(depth) => {
                ret.internal_pos_mut(depth).pos += 1;
                descend_from(ctx, &mut ret, depth - 1, DescentSlot::First, visitor)?;
                Ok(ret)
            }
        }
    }

    /// Lowest depth the preemptive split must start from: 0 when the leaf
    /// has room, the height of the full-from-the-bottom run otherwise,
    /// and the full depth when the root itself is at max capacity.
    pub(crate) fn check_split(&self) -> u8 {
        if !self.leaf.node.at_max_capacity() {
            return 0;
        }
        for depth in 2..=self.depth() {
            if !self.internal_pos(depth).node.at_max_capacity() {
                return depth - 1;
            }
        }
        self.depth()
    }
}

/// Re-descend from the level below `from_depth + 1` down to the leaf,
/// landing on the first or last slot of every node along the way.
///
/// The cursor's positions above `from_depth` must already be valid; the
/// levels at and below it are overwritten. May suspend on every fetch.
fn descend_from(
    ctx: TreeContext<'_>,
    cursor: &mut LbaCursor,
    from_depth: u8,
    slot: DescentSlot,
    visitor: &mut dyn FnMut(NodeMeta),
) -> Result<()> {
    for depth in (2..=from_depth).rev() {
        let addr = cursor.internal_pos(depth + 1).child_addr();
        let node = get_internal_node(ctx, depth, addr)?;
        visitor(node.meta());
        let pos = match slot {
            DescentSlot::First => 0,
            DescentSlot::Last => node.node_size() - 1,
        };
        *cursor.internal_pos_mut(depth) = NodePosition::new(node, pos);
    }

    let addr = cursor.internal_pos(2).child_addr();
    let leaf = get_leaf_node(ctx, addr)?;
    visitor(leaf.meta());
    let pos = match slot {
        DescentSlot::First => 0,
        DescentSlot::Last => leaf.node_size() - 1,
    };
    cursor.leaf = NodePosition::new(leaf, pos);
    Ok(())
}
