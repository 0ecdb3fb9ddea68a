/// Utility functions for the caption transformer
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::VarMap;

/// Number of scalar parameters held by a varmap
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}

/// Pick CUDA when candle reports it, otherwise the CPU
pub fn select_device() -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)
    } else {
        Ok(Device::Cpu)
    }
}

/// Key mask for padded sequences
///
/// # Arguments
/// * `seq` - Token ids [batch, seq_len]
/// * `pad_idx` - Padding token
///
/// # Returns
/// u8 mask [batch, 1, seq_len], 1 where the token is not padding
pub fn pad_mask(seq: &Tensor, pad_idx: u32) -> Result<Tensor> {
    let pad = Tensor::full(pad_idx, seq.shape(), seq.device())?.to_dtype(seq.dtype())?;
    seq.ne(&pad)?.unsqueeze(1)
}

/// Subsequent (causal) mask
///
/// Returns a u8 mask [1, seq_len, seq_len] with 1s on/below the diagonal and
/// 0s above it, so position `i` only sees positions `0..=i`.
pub fn subsequent_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0u8; seq_len * seq_len];

    for i in 0..seq_len {
        for j in 0..=i {
            mask_data[i * seq_len + j] = 1;
        }
    }

    Tensor::from_vec(mask_data, (1, seq_len, seq_len), device)
}

/// Decoder self-attention mask: padding AND subsequent
///
/// # Returns
/// u8 mask [batch, seq_len, seq_len]
pub fn target_mask(seq: &Tensor, pad_idx: u32) -> Result<Tensor> {
    let (batch_size, seq_len) = seq.dims2()?;
    let pad = pad_mask(seq, pad_idx)?.broadcast_as((batch_size, seq_len, seq_len))?;
    let causal = subsequent_mask(seq_len, seq.device())?.broadcast_as((batch_size, seq_len, seq_len))?;

    // Both masks are 0/1, so the product is a logical AND
    (pad.to_dtype(DType::U32)? * causal.to_dtype(DType::U32)?)?.to_dtype(DType::U8)
}
