//! Node bodies: sorted entry arrays with range metadata.
//!
//! Leaves map keys to [`LbaValue`] records; internal nodes map pivot keys
//! to child addresses. Both are the same generic body with algorithms
//! keyed by the value type, per the sum-type design: split, merge, and
//! balance are pure functions over entry arrays, and the tree wraps their
//! results in cache allocations.

use loam_cache::{ExtentPayload, ExtentRef};
use loam_types::{LBA_BLOCK_SIZE, Laddr, LbaValue, NodeCapacity, NodeMeta, Paddr};

/// Shared handle to a cached tree extent.
pub type NodeRef = ExtentRef<TreeExtent>;

// ── Node bodies ─────────────────────────────────────────────────────────────

/// Sorted (key, value) entries plus the node's self-description.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeBody<V> {
    meta: NodeMeta,
    cap: NodeCapacity,
    entries: Vec<(Laddr, V)>,
}

/// Leaf: maps a logical address to the extent record backing it.
pub type LeafNode = NodeBody<LbaValue>;

/// Internal node: maps a pivot key to the child covering `[pivot, next)`.
pub type InternalNode = NodeBody<Paddr>;

impl<V: Clone> NodeBody<V> {
    #[must_use]
    pub fn new(meta: NodeMeta, cap: NodeCapacity) -> Self {
        Self {
            meta,
            cap,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn meta(&self) -> NodeMeta {
        self.meta
    }

    pub fn set_meta(&mut self, meta: NodeMeta) {
        self.meta = meta;
    }

    #[must_use]
    pub fn capacity(&self) -> NodeCapacity {
        self.cap
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[(Laddr, V)] {
        &self.entries
    }

    #[must_use]
    pub fn key_at(&self, idx: usize) -> Laddr {
        self.entries[idx].0
    }

    #[must_use]
    pub fn val_at(&self, idx: usize) -> &V {
        &self.entries[idx].1
    }

    #[must_use]
    pub fn first_key(&self) -> Laddr {
        self.entries[0].0
    }

    #[must_use]
    pub fn last_key(&self) -> Laddr {
        self.entries[self.entries.len() - 1].0
    }

    /// Index of the first entry with key >= `key`.
    #[must_use]
    pub fn lower_bound(&self, key: Laddr) -> usize {
        self.entries.partition_point(|(k, _)| *k < key)
    }

    /// Index of the first entry with key > `key`.
    #[must_use]
    pub fn upper_bound(&self, key: Laddr) -> usize {
        self.entries.partition_point(|(k, _)| *k <= key)
    }

    #[must_use]
    pub fn at_max_capacity(&self) -> bool {
        self.entries.len() >= self.cap.max
    }

    #[must_use]
    pub fn at_min_capacity(&self) -> bool {
        self.entries.len() <= self.cap.min
    }

    pub fn insert(&mut self, idx: usize, key: Laddr, val: V) {
        debug_assert!(idx == 0 || self.entries[idx - 1].0 < key);
        debug_assert!(idx == self.entries.len() || self.entries[idx].0 > key);
        self.entries.insert(idx, (key, val));
    }

    pub fn update(&mut self, idx: usize, val: V) {
        self.entries[idx].1 = val;
    }

    pub fn replace(&mut self, idx: usize, key: Laddr, val: V) {
        debug_assert!(idx == 0 || self.entries[idx - 1].0 < key);
        debug_assert!(idx + 1 == self.entries.len() || self.entries[idx + 1].0 > key);
        self.entries[idx] = (key, val);
    }

    pub fn remove(&mut self, idx: usize) {
        self.entries.remove(idx);
    }

    /// Split into two children around the middle entry.
    ///
    /// The pivot is the right child's first key, which also becomes its
    /// `meta.begin`.
    #[must_use]
    pub fn make_split_children(&self) -> (Self, Self, Laddr) {
        debug_assert!(self.entries.len() >= 2, "split of near-empty node");
        let pivot_idx = self.entries.len() / 2;
        let pivot = self.entries[pivot_idx].0;
        let (left_meta, right_meta) = self.meta.split_at(pivot);
        let left = Self {
            meta: left_meta,
            cap: self.cap,
            entries: self.entries[..pivot_idx].to_vec(),
        };
        let right = Self {
            meta: right_meta,
            cap: self.cap,
            entries: self.entries[pivot_idx..].to_vec(),
        };
        (left, right, pivot)
    }

    /// Concatenate this node with its right sibling.
    #[must_use]
    pub fn make_full_merge(&self, right: &Self) -> Self {
        debug_assert!(self.entries.len() + right.entries.len() <= self.cap.max);
        let mut entries = Vec::with_capacity(self.entries.len() + right.entries.len());
        entries.extend_from_slice(&self.entries);
        entries.extend_from_slice(&right.entries);
        Self {
            meta: self.meta.merge_with(right.meta),
            cap: self.cap,
            entries,
        }
    }

    /// Redistribute entries with the right sibling to roughly equal sizes,
    /// ties broken toward the left when `prefer_left`.
    #[must_use]
    pub fn make_balanced(&self, right: &Self, prefer_left: bool) -> (Self, Self, Laddr) {
        let total = self.entries.len() + right.entries.len();
        let left_target = if prefer_left {
            total.div_ceil(2)
        } else {
            total / 2
        };
        debug_assert!(left_target >= 1 && left_target < total);

        let mut entries = Vec::with_capacity(total);
        entries.extend_from_slice(&self.entries);
        entries.extend_from_slice(&right.entries);
        let right_entries = entries.split_off(left_target);

        let pivot = right_entries[0].0;
        let merged = self.meta.merge_with(right.meta);
        let (left_meta, right_meta) = merged.split_at(pivot);
        (
            Self {
                meta: left_meta,
                cap: self.cap,
                entries,
            },
            Self {
                meta: right_meta,
                cap: self.cap,
                entries: right_entries,
            },
            pivot,
        )
    }
}

impl InternalNode {
    /// Raw child address at `idx`; may still be block-relative.
    #[must_use]
    pub fn child_at(&self, idx: usize) -> Paddr {
        self.entries[idx].1
    }

    /// Shift every embedded block-relative child by `delta` blocks.
    ///
    /// Called when the node is rewritten to a new location so staged
    /// relative references resolve against the new block after commit.
    pub fn resolve_relative_addrs(&mut self, delta: i64) {
        for entry in &mut self.entries {
            entry.1 = entry.1.rebase_block_relative(delta);
        }
    }
}

// ── Logical data extents ────────────────────────────────────────────────────

/// A logical data block owned by some mapping in the tree.
///
/// The tree never interprets the contents; it only checks liveness of the
/// `(laddr, paddr)` pair when the cache surfaces one of these from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalData {
    laddr: Laddr,
    bytes: Vec<u8>,
}

impl LogicalData {
    #[must_use]
    pub fn new(laddr: Laddr, bytes: Vec<u8>) -> Self {
        Self { laddr, bytes }
    }

    #[must_use]
    pub fn zeroed(laddr: Laddr, len: u32) -> Self {
        Self {
            laddr,
            bytes: vec![0_u8; len as usize],
        }
    }

    #[must_use]
    pub fn laddr(&self) -> Laddr {
        self.laddr
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ── Extent payload ──────────────────────────────────────────────────────────

/// Everything the tree's cache can hold.
#[derive(Debug, Clone)]
pub enum TreeExtent {
    Leaf(LeafNode),
    Internal(InternalNode),
    Data(LogicalData),
}

impl TreeExtent {
    /// Node metadata, `None` for data extents.
    #[must_use]
    pub fn node_meta(&self) -> Option<NodeMeta> {
        match self {
            Self::Leaf(node) => Some(node.meta()),
            Self::Internal(node) => Some(node.meta()),
            Self::Data(_) => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Leaf(_) => "leaf",
            Self::Internal(_) => "internal",
            Self::Data(_) => "data",
        }
    }

    #[must_use]
    pub fn is_node(&self) -> bool {
        !matches!(self, Self::Data(_))
    }
}

impl ExtentPayload for TreeExtent {
    fn length(&self) -> u32 {
        match self {
            Self::Leaf(_) | Self::Internal(_) => LBA_BLOCK_SIZE,
            Self::Data(data) => u32::try_from(data.bytes.len()).unwrap_or(u32::MAX),
        }
    }
}

// ── Typed access through extent refs ────────────────────────────────────────

/// Typed views onto a cached tree extent.
///
/// Kind mismatches are structural corruption and fail fast.
pub trait NodeExtentExt {
    fn meta(&self) -> NodeMeta;
    fn node_size(&self) -> usize;
    fn at_min_capacity(&self) -> bool;
    fn at_max_capacity(&self) -> bool;
    fn with_leaf<R>(&self, f: impl FnOnce(&LeafNode) -> R) -> R;
    fn with_leaf_mut<R>(&self, f: impl FnOnce(&mut LeafNode) -> R) -> R;
    fn with_internal<R>(&self, f: impl FnOnce(&InternalNode) -> R) -> R;
    fn with_internal_mut<R>(&self, f: impl FnOnce(&mut InternalNode) -> R) -> R;
}

impl NodeExtentExt for NodeRef {
    fn meta(&self) -> NodeMeta {
        self.with_payload(|payload| payload.node_meta())
            .unwrap_or_else(|| panic!("extent at {} is not a tree node", self.paddr()))
    }

    fn node_size(&self) -> usize {
        self.with_payload(|payload| match payload {
            TreeExtent::Leaf(node) => node.len(),
            TreeExtent::Internal(node) => node.len(),
            TreeExtent::Data(_) => panic!("extent at {} is not a tree node", self.paddr()),
        })
    }

    fn at_min_capacity(&self) -> bool {
        self.with_payload(|payload| match payload {
            TreeExtent::Leaf(node) => node.at_min_capacity(),
            TreeExtent::Internal(node) => node.at_min_capacity(),
            TreeExtent::Data(_) => panic!("extent at {} is not a tree node", self.paddr()),
        })
    }

    fn at_max_capacity(&self) -> bool {
        self.with_payload(|payload| match payload {
            TreeExtent::Leaf(node) => node.at_max_capacity(),
            TreeExtent::Internal(node) => node.at_max_capacity(),
            TreeExtent::Data(_) => panic!("extent at {} is not a tree node", self.paddr()),
        })
    }

    fn with_leaf<R>(&self, f: impl FnOnce(&LeafNode) -> R) -> R {
        self.with_payload(|payload| match payload {
            TreeExtent::Leaf(node) => f(node),
            other => panic!("extent at {} is {}, expected leaf", self.paddr(), other.kind()),
        })
    }

    fn with_leaf_mut<R>(&self, f: impl FnOnce(&mut LeafNode) -> R) -> R {
        self.with_payload_mut(|payload| match payload {
            TreeExtent::Leaf(node) => f(node),
            other => panic!("extent at {} is {}, expected leaf", self.paddr(), other.kind()),
        })
    }

    fn with_internal<R>(&self, f: impl FnOnce(&InternalNode) -> R) -> R {
        self.with_payload(|payload| match payload {
            TreeExtent::Internal(node) => f(node),
            other => panic!(
                "extent at {} is {}, expected internal node",
                self.paddr(),
                other.kind()
            ),
        })
    }

    fn with_internal_mut<R>(&self, f: impl FnOnce(&mut InternalNode) -> R) -> R {
        self.with_payload_mut(|payload| match payload {
            TreeExtent::Internal(node) => f(node),
            other => panic!(
                "extent at {} is {}, expected internal node",
                self.paddr(),
                other.kind()
            ),
        })
    }
}
