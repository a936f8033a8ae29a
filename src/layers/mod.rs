//! Reusable layers.

pub mod drop;
