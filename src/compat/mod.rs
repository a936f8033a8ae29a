//! Crate-private helpers shared across models.

/// Shape arithmetic helpers.
pub mod dims;

/// Small tensor-op helpers.
pub mod ops;
