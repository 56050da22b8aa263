#![forbid(unsafe_code)]
//! Transactional copy-on-write B+tree over a logical address space.
//!
//! Maps fixed-width logical addresses to `{paddr, len, refcount, flags}`
//! records through an external extent cache. Structural mutation is
//! copy-on-write: touched nodes are promoted to transaction-pending
//! duplicates, splits are preemptive on the way down, merges cascade
//! bottom-up, and the root descriptor is the only state the tree itself
//! owns.

pub mod check;
mod cursor;
mod node;
mod tree;

pub use cursor::{CursorMode, LbaCursor};
pub use node::{InternalNode, LeafNode, LogicalData, NodeBody, NodeExtentExt, NodeRef, TreeExtent};
pub use tree::LbaTree;

/// Context every tree operation takes by value: cancellation capability,
/// cache, and transaction.
pub type TreeContext<'a> = loam_cache::OpContext<'a, TreeExtent>;
