/// Position-wise feed-forward sublayer
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Dropout, Linear, VarBuilder};

use super::normalization::{LayerNorm, LAYER_NORM_EPS};

/// Two-layer feed-forward network applied to every position
///
/// Formula: layer_norm(x + dropout(w_2(relu(w_1(x)))))
pub struct PositionwiseFeedForward {
    w_1: Linear,
    w_2: Linear,
    dropout: Dropout,
    layer_norm: LayerNorm,
}

impl PositionwiseFeedForward {
    /// Create new feed-forward sublayer
    ///
    /// # Arguments
    /// * `d_in` - Input/output dimension
    /// * `d_hid` - Inner dimension
    /// * `dropout` - Dropout probability
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(d_in: usize, d_hid: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_1: linear(d_in, d_hid, vb.pp("w_1"))?,
            w_2: linear(d_hid, d_in, vb.pp("w_2"))?,
            dropout: Dropout::new(dropout),
            layer_norm: LayerNorm::new(d_in, LAYER_NORM_EPS, vb.pp("layer_norm"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.w_1.forward(x)?.relu()?;
        let output = self.dropout.forward(&self.w_2.forward(&hidden)?, train)?;
        self.layer_norm.forward(&(output + x)?)
    }
}
