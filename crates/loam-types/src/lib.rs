#![forbid(unsafe_code)]
//! Shared types for the loam LBA mapping tree.
//!
//! Defines the logical/physical address newtypes, the leaf value record,
//! node metadata, the root descriptor, and the per-node capacity shape
//! used by the B+tree and the extent cache.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of every tree node block, leaf and internal alike.
pub const LBA_BLOCK_SIZE: u32 = 4096;

/// Bytes reserved at the front of a node block for size + meta encoding.
const NODE_HEADER_SIZE: u32 = 32;
/// Encoded bytes per leaf entry: key (8) + paddr (8) + len/refcount/flags (12).
const LEAF_ENTRY_SIZE: u32 = 28;
/// Encoded bytes per internal entry: pivot key (8) + child paddr (8).
const INTERNAL_ENTRY_SIZE: u32 = 16;

// ── Logical addresses ───────────────────────────────────────────────────────

/// Logical address: a key in the mapped space.
///
/// `Laddr::MIN` is the reserved minimum sentinel; `Laddr::MAX` is
/// one-past-the-maximum. The tree covers `[MIN, MAX)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Laddr(pub u64);

impl Laddr {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// End of a logical extent of `len` bytes starting here (saturating).
    #[must_use]
    pub fn extent_end(self, len: u32) -> Self {
        Self(self.0.saturating_add(u64::from(len)))
    }
}

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── Physical addresses ──────────────────────────────────────────────────────

/// Physical address: an opaque on-disk block identifier.
///
/// During write staging an address may be expressed relative to the record
/// being built (`RecordRelative`) or relative to the block that contains it
/// (`BlockRelative`). Relative forms must be resolved through
/// [`Paddr::maybe_relative_to`] before being used as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Paddr {
    /// No backing block.
    Null,
    /// Absolute block identifier.
    Absolute(u64),
    /// Offset relative to the start of the record under construction.
    RecordRelative(i64),
    /// Offset relative to the containing block's own address.
    BlockRelative(i64),
}

impl Paddr {
    pub const NULL: Self = Self::Null;

    #[must_use]
    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_relative(self) -> bool {
        matches!(self, Self::RecordRelative(_) | Self::BlockRelative(_))
    }

    /// The absolute block id, if this address is absolute.
    #[must_use]
    pub fn as_absolute(self) -> Option<u64> {
        match self {
            Self::Absolute(block) => Some(block),
            _ => None,
        }
    }

    /// Resolve a block-relative address against `base`.
    ///
    /// Absolute and record-relative addresses pass through unchanged; a
    /// block-relative offset is rebased onto `base`, which must itself be
    /// absolute.
    #[must_use]
    pub fn maybe_relative_to(self, base: Self) -> Self {
        match (self, base) {
            (Self::BlockRelative(off), Self::Absolute(block)) => {
                Self::Absolute(block.wrapping_add_signed(off))
            }
            _ => self,
        }
    }

    /// Shift a block-relative offset by `delta` blocks.
    ///
    /// Used when a node is rewritten to a new location: embedded
    /// block-relative children stay correct by absorbing the distance
    /// between the old and new block. Non-relative forms are unchanged.
    #[must_use]
    pub fn rebase_block_relative(self, delta: i64) -> Self {
        match self {
            Self::BlockRelative(off) => Self::BlockRelative(off.wrapping_add(delta)),
            other => other,
        }
    }
}

impl Default for Paddr {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Absolute(block) => write!(f, "{block}"),
            Self::RecordRelative(off) => write!(f, "rec{off:+}"),
            Self::BlockRelative(off) => write!(f, "blk{off:+}"),
        }
    }
}

// ── Transactions ────────────────────────────────────────────────────────────

/// Transaction identifier, unique per cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-transaction tree statistics, persisted by the caller on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LbaTreeStats {
    /// Current tree depth (leaves are depth 1).
    pub depth: u8,
}

// ── Leaf values ─────────────────────────────────────────────────────────────

/// Value record stored in a leaf: where a logical extent lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbaValue {
    pub paddr: Paddr,
    pub len: u32,
    pub refcount: u32,
    pub flags: u32,
}

impl LbaValue {
    #[must_use]
    pub fn new(paddr: Paddr, len: u32) -> Self {
        Self {
            paddr,
            len,
            refcount: 1,
            flags: 0,
        }
    }
}

impl fmt::Display for LbaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}~{} rc={} fl={:#x}",
            self.paddr, self.len, self.refcount, self.flags
        )
    }
}

// ── Node metadata ───────────────────────────────────────────────────────────

/// A node's self-description: the half-open key range it covers and its
/// level in the tree (leaves are depth 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub begin: Laddr,
    pub end: Laddr,
    pub depth: u8,
}

impl NodeMeta {
    #[must_use]
    pub fn new(begin: Laddr, end: Laddr, depth: u8) -> Self {
        Self { begin, end, depth }
    }

    #[must_use]
    pub fn is_leaf(self) -> bool {
        self.depth == 1
    }

    #[must_use]
    pub fn contains(self, key: Laddr) -> bool {
        self.begin <= key && key < self.end
    }

    /// Derive the left/right halves produced by a split at `pivot`.
    #[must_use]
    pub fn split_at(self, pivot: Laddr) -> (Self, Self) {
        (
            Self::new(self.begin, pivot, self.depth),
            Self::new(pivot, self.end, self.depth),
        )
    }

    /// Derive the metadata of a node merged from two adjacent siblings.
    #[must_use]
    pub fn merge_with(self, right: Self) -> Self {
        debug_assert_eq!(self.end, right.begin);
        debug_assert_eq!(self.depth, right.depth);
        Self::new(self.begin, right.end, self.depth)
    }
}

impl fmt::Display for NodeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}) depth={}", self.begin, self.end, self.depth)
    }
}

// ── Root descriptor ─────────────────────────────────────────────────────────

/// Names the current root: its physical location and the tree depth.
///
/// Persisted out-of-band by the caller whenever the tree marks it dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDescriptor {
    pub location: Paddr,
    pub depth: u8,
}

impl RootDescriptor {
    #[must_use]
    pub fn new(location: Paddr, depth: u8) -> Self {
        Self { location, depth }
    }
}

impl fmt::Display for RootDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root at {} depth {}", self.location, self.depth)
    }
}

// ── Node capacity shape ─────────────────────────────────────────────────────

/// Size bounds for one node kind.
///
/// `min` is half of `max` so that splitting a full node yields two
/// non-minimal children and fully merging two minimal nodes never
/// overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub min: usize,
    pub max: usize,
}

impl NodeCapacity {
    #[must_use]
    pub fn from_max(max: usize) -> Self {
        debug_assert!(max >= 4, "capacity below 4 cannot split into legal halves");
        Self { min: max / 2, max }
    }
}

/// Capacity shape for the whole tree, per node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub leaf: NodeCapacity,
    pub internal: NodeCapacity,
}

impl TreeShape {
    /// Shape with uniform capacity for both node kinds (test trees use
    /// small values here to force structural churn).
    #[must_use]
    pub fn uniform(max: usize) -> Self {
        Self {
            leaf: NodeCapacity::from_max(max),
            internal: NodeCapacity::from_max(max),
        }
    }
}

impl Default for TreeShape {
    fn default() -> Self {
        let payload = LBA_BLOCK_SIZE - NODE_HEADER_SIZE;
        Self {
            leaf: NodeCapacity::from_max((payload / LEAF_ENTRY_SIZE) as usize),
            internal: NodeCapacity::from_max((payload / INTERNAL_ENTRY_SIZE) as usize),
        }
    }
}
