/// Neural network layer primitives
///
/// Building blocks for the caption transformer:
/// - Multi-head attention (self and encoder-decoder)
/// - Position-wise feed-forward
/// - Layer normalization
/// - Sinusoidal positional encoding
/// - Token embeddings (shareable with the output projection)

pub mod attention;
pub mod embeddings;
pub mod feed_forward;
pub mod normalization;
pub mod positional;

pub use attention::MultiHeadAttention;
pub use embeddings::TokenEmbedding;
pub use feed_forward::PositionwiseFeedForward;
pub use normalization::LayerNorm;
pub use positional::PositionalEncoding;
