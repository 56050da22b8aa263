#![forbid(unsafe_code)]
//! Error types for loam.
//!
//! Defines `LoamError` and a `Result<T>` alias used throughout the
//! workspace. Structural-invariant violations are deliberately *not*
//! represented here: they indicate corruption the tree cannot recover
//! from and surface as fatal assertions instead.

use thiserror::Error;

/// Unified error type for all loam operations.
#[derive(Debug, Error)]
pub enum LoamError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("extent not found: {0}")]
    NotFound(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Result alias using `LoamError`.
pub type Result<T> = std::result::Result<T, LoamError>;
