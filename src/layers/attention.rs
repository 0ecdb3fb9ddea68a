/// Multi-head attention for the caption encoder and decoder
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Dropout, Linear, VarBuilder};

use super::normalization::{LayerNorm, LAYER_NORM_EPS};

/// Score written into masked-out attention positions
const MASK_FILL: f32 = -1e9;

/// Multi-head attention with a post-residual layer norm
///
/// Used three ways:
/// - encoder self-attention over image regions (no mask)
/// - decoder self-attention over caption tokens (pad + subsequent mask)
/// - decoder attention over encoder output (no mask)
pub struct MultiHeadAttention {
    n_head: usize,
    d_k: usize,
    d_v: usize,

    w_qs: Linear,
    w_ks: Linear,
    w_vs: Linear,
    fc: Linear,

    attn_dropout: Dropout,
    dropout: Dropout,
    layer_norm: LayerNorm,
}

impl MultiHeadAttention {
    /// Create new MultiHeadAttention layer
    ///
    /// # Arguments
    /// * `n_head` - Number of attention heads
    /// * `d_model` - Input/output dimension
    /// * `d_k` - Query/key dimension per head
    /// * `d_v` - Value dimension per head
    /// * `dropout` - Dropout probability for attention weights and output
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        n_head: usize,
        d_model: usize,
        d_k: usize,
        d_v: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w_qs = linear_no_bias(d_model, n_head * d_k, vb.pp("w_qs"))?;
        let w_ks = linear_no_bias(d_model, n_head * d_k, vb.pp("w_ks"))?;
        let w_vs = linear_no_bias(d_model, n_head * d_v, vb.pp("w_vs"))?;
        let fc = linear_no_bias(n_head * d_v, d_model, vb.pp("fc"))?;
        let layer_norm = LayerNorm::new(d_model, LAYER_NORM_EPS, vb.pp("layer_norm"))?;

        Ok(Self {
            n_head,
            d_k,
            d_v,
            w_qs,
            w_ks,
            w_vs,
            fc,
            attn_dropout: Dropout::new(dropout),
            dropout: Dropout::new(dropout),
            layer_norm,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `q` - Queries [batch, len_q, d_model]
    /// * `k` - Keys [batch, len_k, d_model]
    /// * `v` - Values [batch, len_k, d_model]
    /// * `mask` - Optional u8 mask [batch, len_q or 1, len_k], 1 = attend
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Output tensor [batch, len_q, d_model]
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, len_q, _) = q.dims3()?;
        let len_k = k.dim(1)?;
        let len_v = v.dim(1)?;

        let residual = q;

        // [batch, len, n_head * d] -> [batch, n_head, len, d]
        let query = self
            .w_qs
            .forward(q)?
            .reshape((batch_size, len_q, self.n_head, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;
        let key = self
            .w_ks
            .forward(k)?
            .reshape((batch_size, len_k, self.n_head, self.d_k))?
            .transpose(1, 2)?
            .contiguous()?;
        let value = self
            .w_vs
            .forward(v)?
            .reshape((batch_size, len_v, self.n_head, self.d_v))?
            .transpose(1, 2)?
            .contiguous()?;

        // Head axis for broadcasting: [batch, 1, len_q or 1, len_k]
        let mask = match mask {
            Some(m) => Some(m.unsqueeze(1)?),
            None => None,
        };

        let temperature = (self.d_k as f64).sqrt();
        let attn_output = scaled_dot_product_attention(
            &query,
            &key,
            &value,
            mask.as_ref(),
            temperature,
            &self.attn_dropout,
            train,
        )?;

        // [batch, n_head, len_q, d_v] -> [batch, len_q, n_head * d_v]
        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, len_q, self.n_head * self.d_v))?;

        let output = self.dropout.forward(&self.fc.forward(&attn_output)?, train)?;
        self.layer_norm.forward(&(output + residual)?)
    }
}

/// Scaled dot-product attention
///
/// attention = softmax(Q @ K^T / temperature) @ V
fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&Tensor>,
    temperature: f64,
    dropout: &Dropout,
    train: bool,
) -> Result<Tensor> {
    let scores = (query / temperature)?.matmul(&key.transpose(2, 3)?)?;

    let scores = match mask {
        Some(mask) => masked_fill(&scores, mask, MASK_FILL)?,
        None => scores,
    };

    // Plain softmax keeps the op differentiable
    let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let attn_weights = dropout.forward(&attn_weights, train)?;

    attn_weights.matmul(value)
}

/// Keep `scores` where `mask` is non-zero, write `fill` elsewhere
fn masked_fill(scores: &Tensor, mask: &Tensor, fill: f32) -> Result<Tensor> {
    let shape = scores.shape();
    let mask = mask.broadcast_as(shape)?;
    let fill = Tensor::new(fill, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    mask.where_cond(scores, &fill)
}
