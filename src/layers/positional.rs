/// Sinusoidal positional encoding
use candle_core::{Device, Result, Tensor};

/// Angle for position `pos` and hidden index `i`
fn position_angle(pos: usize, i: usize, d_hid: usize) -> f64 {
    pos as f64 / 10000f64.powf(2.0 * (i / 2) as f64 / d_hid as f64)
}

/// Fixed sine/cosine position table added to token embeddings
///
/// Even hidden indices hold `sin`, odd ones `cos`.
pub struct PositionalEncoding {
    /// [n_position, d_hid]
    table: Tensor,
    n_position: usize,
}

impl PositionalEncoding {
    pub fn new(d_hid: usize, n_position: usize, device: &Device) -> Result<Self> {
        let mut data = Vec::with_capacity(n_position * d_hid);
        for pos in 0..n_position {
            for i in 0..d_hid {
                let angle = position_angle(pos, i, d_hid);
                let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
                data.push(value as f32);
            }
        }

        let table = Tensor::from_vec(data, (n_position, d_hid), device)?;
        Ok(Self { table, n_position })
    }

    /// Add encodings for the first `seq_len` positions
    ///
    /// # Arguments
    /// * `x` - Embeddings [batch, seq_len, d_hid]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        if seq_len > self.n_position {
            candle_core::bail!(
                "sequence length {} exceeds position table size {}",
                seq_len,
                self.n_position
            );
        }

        let table = self.table.narrow(0, 0, seq_len)?.to_dtype(x.dtype())?;
        x.broadcast_add(&table.unsqueeze(0)?)
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_table_values() -> Result<()> {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(4, 10, &device)?;

        let table = pe.table().to_vec2::<f32>()?;

        // Position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(table[0], vec![0.0, 1.0, 0.0, 1.0]);

        // Position 1, index 0: sin(1)
        assert!((table[1][0] - 1f32.sin()).abs() < 1e-6);
        // Position 1, index 3: cos(1 / 10000^(2/4))
        assert!((table[1][3] - (0.01f32).cos()).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn test_forward_adds_table() -> Result<()> {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 16, &device)?;

        let x = Tensor::zeros((2, 5, 8), DType::F32, &device)?;
        let out = pe.forward(&x)?;

        assert_eq!(out.dims(), &[2, 5, 8]);
        let expected = pe.table().narrow(0, 0, 5)?;
        let diff = (out.get(1)? - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);

        Ok(())
    }

    #[test]
    fn test_sequence_too_long() -> Result<()> {
        let device = Device::Cpu;
        let pe = PositionalEncoding::new(8, 4, &device)?;

        let x = Tensor::zeros((1, 5, 8), DType::F32, &device)?;
        assert!(pe.forward(&x).is_err());

        Ok(())
    }
}
