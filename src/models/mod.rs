//! Model implementations.

pub mod classifier;
pub mod segformer;
pub mod unet;
