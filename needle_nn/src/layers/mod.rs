//! Layers with trainable parameters.

mod conv;
mod linear;

pub use conv::{ConvGp, ConvOptions};
pub use linear::Linear;
