//! SegFormer: hierarchical transformer encoders for semantic segmentation.
//!
//! https://arxiv.org/abs/2105.15203

pub mod attention;
pub mod backbone;
pub mod block;
pub mod dpr;
pub mod embed;
pub mod ffn;
pub mod head;
pub mod model;
