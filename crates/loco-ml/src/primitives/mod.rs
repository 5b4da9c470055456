//! Neural network building blocks
//!
//! Layers own their parameters and refuse to run until weights are loaded.

pub mod activation;
pub mod attention;
pub mod linear;
pub mod norm;
pub mod rotary;
pub mod swiglu;

pub use activation::{gelu, sigmoid, swish};
pub use attention::{MultiHeadAttention, Projection};
pub use linear::{Conv1d, Linear};
pub use norm::RmsGroupNorm;
pub use rotary::RotaryEmbedding;
pub use swiglu::ConvSwiGLU;
