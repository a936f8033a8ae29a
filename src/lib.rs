#![warn(missing_docs)]
//!# bvm - Burn Vision Models

#[allow(dead_code)]
pub(crate) mod compat;

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod testing;

pub mod layers;

pub mod models;
