#![forbid(unsafe_code)]
//! loam public API facade.
//!
//! Re-exports the LBA tree, the extent cache it mutates through, and the
//! shared types behind one stable interface.

pub use loam_btree::*;
pub use loam_cache::{
    CachedExtent, ExtentCache, ExtentPayload, ExtentRef, ExtentState, OpContext, Transaction,
};
pub use loam_error::{LoamError, Result};
pub use loam_types::*;
