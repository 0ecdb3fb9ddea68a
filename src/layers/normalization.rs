/// Layer normalization built from differentiable tensor ops
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Epsilon used by every layer norm in the model
pub const LAYER_NORM_EPS: f64 = 1e-6;

/// Layer normalization function
///
/// Normalizes over the last dimension to zero mean and unit variance.
/// The computation is done in f32 for precision, then cast back to the
/// original dtype.
///
/// # Arguments
/// * `hidden_states` - Input tensor
/// * `eps` - Small constant for numerical stability
///
/// # Returns
/// Normalized tensor with same shape and dtype as input
pub fn layer_norm(hidden_states: &Tensor, eps: f64) -> Result<Tensor> {
    let input_dtype = hidden_states.dtype();

    let hidden_states = if input_dtype != DType::F32 {
        hidden_states.to_dtype(DType::F32)?
    } else {
        hidden_states.clone()
    };

    let mean = hidden_states.mean_keepdim(D::Minus1)?;
    let centered = hidden_states.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = centered.broadcast_div(&(variance + eps)?.sqrt()?)?;

    if input_dtype != DType::F32 {
        normalized.to_dtype(input_dtype)
    } else {
        Ok(normalized)
    }
}

/// Layer normalization with learnable scale and shift
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        layer_norm(x, self.eps)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}
