/// Caption transformer: image-feature encoder + caption decoder
use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::normalization::LAYER_NORM_EPS;
use crate::layers::{
    LayerNorm, MultiHeadAttention, PositionalEncoding, PositionwiseFeedForward, TokenEmbedding,
};
use crate::utils::target_mask;

/// A model that scores the next caption token at every position
///
/// The epoch drivers only depend on this seam, so any encoder-decoder that
/// maps `(source, target_input)` to per-token class scores can be trained.
pub trait SequenceModel {
    /// Forward pass
    ///
    /// # Arguments
    /// * `src` - Image features [batch, regions, feature_dim]
    /// * `trg_seq` - Caption tokens fed to the decoder [batch, seq_len]
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Class scores [batch, seq_len, vocab_size]
    fn forward_t(&self, src: &Tensor, trg_seq: &Tensor, train: bool) -> Result<Tensor>;
}

/// Encoder block: self-attention over image regions, then feed-forward
pub struct EncoderLayer {
    slf_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl EncoderLayer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            slf_attn: MultiHeadAttention::new(
                config.n_head,
                config.d_model,
                config.d_k,
                config.d_v,
                config.dropout,
                vb.pp("slf_attn"),
            )?,
            pos_ffn: PositionwiseFeedForward::new(
                config.d_model,
                config.d_inner,
                config.dropout,
                vb.pp("pos_ffn"),
            )?,
        })
    }

    pub fn forward(&self, enc_input: &Tensor, train: bool) -> Result<Tensor> {
        let enc_output = self
            .slf_attn
            .forward(enc_input, enc_input, enc_input, None, train)?;
        self.pos_ffn.forward(&enc_output, train)
    }
}

/// Decoder block: masked self-attention, encoder-decoder attention, feed-forward
pub struct DecoderLayer {
    slf_attn: MultiHeadAttention,
    enc_attn: MultiHeadAttention,
    pos_ffn: PositionwiseFeedForward,
}

impl DecoderLayer {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let attention = |name: &str| {
            MultiHeadAttention::new(
                config.n_head,
                config.d_model,
                config.d_k,
                config.d_v,
                config.dropout,
                vb.pp(name),
            )
        };

        Ok(Self {
            slf_attn: attention("slf_attn")?,
            enc_attn: attention("enc_attn")?,
            pos_ffn: PositionwiseFeedForward::new(
                config.d_model,
                config.d_inner,
                config.dropout,
                vb.pp("pos_ffn"),
            )?,
        })
    }

    pub fn forward(
        &self,
        dec_input: &Tensor,
        enc_output: &Tensor,
        slf_attn_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let dec_output =
            self.slf_attn
                .forward(dec_input, dec_input, dec_input, Some(slf_attn_mask), train)?;
        let dec_output = self
            .enc_attn
            .forward(&dec_output, enc_output, enc_output, None, train)?;
        self.pos_ffn.forward(&dec_output, train)
    }
}

/// Image encoder
///
/// Image features are already region embeddings, so the encoder replaces the
/// token embedding with a linear projection to `d_model`.
pub struct Encoder {
    feature_proj: Linear,
    dropout: Dropout,
    layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(EncoderLayer::new(config, vb.pp(&format!("layer_{}", i)))?);
        }

        Ok(Self {
            feature_proj: linear(config.feature_dim, config.d_model, vb.pp("feature_proj"))?,
            dropout: Dropout::new(config.dropout),
            layer_norm: LayerNorm::new(config.d_model, LAYER_NORM_EPS, vb.pp("layer_norm"))?,
            layers,
        })
    }

    /// [batch, regions, feature_dim] -> [batch, regions, d_model]
    pub fn forward(&self, src: &Tensor, train: bool) -> Result<Tensor> {
        let projected = self.feature_proj.forward(src)?.relu()?;
        let mut enc_output = self
            .layer_norm
            .forward(&self.dropout.forward(&projected, train)?)?;

        for layer in &self.layers {
            enc_output = layer.forward(&enc_output, train)?;
        }

        Ok(enc_output)
    }
}

/// Caption decoder
pub struct Decoder {
    trg_word_emb: TokenEmbedding,
    position_enc: PositionalEncoding,
    dropout: Dropout,
    layer_norm: LayerNorm,
    layers: Vec<DecoderLayer>,
}

impl Decoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(DecoderLayer::new(config, vb.pp(&format!("layer_{}", i)))?);
        }

        Ok(Self {
            trg_word_emb: TokenEmbedding::new(
                config.vocab_size,
                config.d_model,
                vb.pp("trg_word_emb"),
            )?,
            position_enc: PositionalEncoding::new(config.d_model, config.n_position, vb.device())?,
            dropout: Dropout::new(config.dropout),
            layer_norm: LayerNorm::new(config.d_model, LAYER_NORM_EPS, vb.pp("layer_norm"))?,
            layers,
        })
    }

    /// [batch, seq_len] tokens -> [batch, seq_len, d_model]
    pub fn forward(
        &self,
        trg_seq: &Tensor,
        trg_mask: &Tensor,
        enc_output: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let embedded = self.trg_word_emb.forward(trg_seq)?;
        let embedded = self.position_enc.forward(&embedded)?;
        let mut dec_output = self
            .layer_norm
            .forward(&self.dropout.forward(&embedded, train)?)?;

        for layer in &self.layers {
            dec_output = layer.forward(&dec_output, enc_output, trg_mask, train)?;
        }

        Ok(dec_output)
    }

    pub fn embedding_weight(&self) -> &Tensor {
        self.trg_word_emb.weight()
    }
}

/// Output projection, either its own matrix or the shared target embedding
enum WordProjection {
    Owned(Linear),
    Shared { scale: f64 },
}

/// Main caption transformer
pub struct CaptionTransformer {
    config: ModelConfig,
    encoder: Encoder,
    decoder: Decoder,
    trg_word_prj: WordProjection,
}

impl CaptionTransformer {
    /// Create new CaptionTransformer
    pub fn new(config: ModelConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let encoder = Encoder::new(&config, vb.pp("encoder"))?;
        let decoder = Decoder::new(&config, vb.pp("decoder"))?;

        let trg_word_prj = if config.trg_emb_prj_weight_sharing {
            WordProjection::Shared {
                scale: (config.d_model as f64).powf(-0.5),
            }
        } else {
            WordProjection::Owned(linear_no_bias(
                config.d_model,
                config.vocab_size,
                vb.pp("trg_word_prj"),
            )?)
        };

        Ok(Self {
            config,
            encoder,
            decoder,
            trg_word_prj,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn project(&self, dec_output: &Tensor) -> Result<Tensor> {
        match &self.trg_word_prj {
            WordProjection::Owned(proj) => proj.forward(dec_output),
            WordProjection::Shared { scale } => {
                let weight_t = self.decoder.embedding_weight().t()?;
                dec_output.broadcast_matmul(&weight_t)? * *scale
            }
        }
    }
}

impl SequenceModel for CaptionTransformer {
    fn forward_t(&self, src: &Tensor, trg_seq: &Tensor, train: bool) -> Result<Tensor> {
        let trg_mask = target_mask(trg_seq, self.config.trg_pad_idx)?;

        let enc_output = self.encoder.forward(src, train)?;
        let dec_output = self.decoder.forward(trg_seq, &trg_mask, &enc_output, train)?;

        self.project(&dec_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 20,
            feature_dim: 12,
            d_model: 16,
            d_inner: 32,
            n_layers: 2,
            n_head: 2,
            d_k: 8,
            d_v: 8,
            dropout: 0.1,
            n_position: 32,
            trg_emb_prj_weight_sharing: true,
            trg_pad_idx: 0,
        }
    }

    #[test]
    fn test_encoder_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let encoder = Encoder::new(&tiny_config(), vb)?;
        let src = Tensor::randn(0f32, 1.0, (2, 9, 12), &device)?;

        assert_eq!(encoder.forward(&src, true)?.dims(), &[2, 9, 16]);

        Ok(())
    }

    #[test]
    fn test_transformer_logits_shape() -> crate::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let model = CaptionTransformer::new(tiny_config(), vb)?;

        let src = Tensor::randn(0f32, 1.0, (2, 9, 12), &device)?;
        let trg = Tensor::new(&[[1u32, 5, 6, 0], [1, 7, 8, 9]], &device)?;
        let logits = model.forward_t(&src, &trg, false)?;

        assert_eq!(logits.dims(), &[2, 4, 20]);

        Ok(())
    }

    #[test]
    fn test_weight_sharing_has_no_separate_projection() -> crate::Result<()> {
        let device = Device::Cpu;

        let shared = VarMap::new();
        let vb = VarBuilder::from_varmap(&shared, DType::F32, &device);
        let _ = CaptionTransformer::new(tiny_config(), vb)?;

        let owned = VarMap::new();
        let vb = VarBuilder::from_varmap(&owned, DType::F32, &device);
        let config = ModelConfig {
            trg_emb_prj_weight_sharing: false,
            ..tiny_config()
        };
        let _ = CaptionTransformer::new(config, vb)?;

        assert_eq!(owned.all_vars().len(), shared.all_vars().len() + 1);
        assert!(!shared.data().lock().unwrap().contains_key("trg_word_prj.weight"));

        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = ModelConfig {
            n_layers: 0,
            ..tiny_config()
        };
        assert!(CaptionTransformer::new(config, vb).is_err());
    }
}
