/// Data loading modules for caption training
pub mod caption_dataset;
pub mod tokenizer;

pub use caption_dataset::{
    captions_for_images, read_caption_file, read_image_names, CaptionDataLoader, CaptionDataset,
};
pub use tokenizer::CaptionTokenizer;

use candle_core::{Device, Result, Tensor};

/// One batch of (image features, caption tokens, image names)
#[derive(Debug, Clone)]
pub struct CaptionBatch {
    /// [batch, regions, feature_dim] f32
    pub images: Tensor,
    /// [batch, seq_len] u32, padded with 0
    pub captions: Tensor,
    pub names: Vec<String>,
}

impl CaptionBatch {
    /// Teacher-forcing split: `(captions[:, :-1], captions[:, 1:])`
    ///
    /// The decoder reads token `t - 1` and is scored on token `t`.
    pub fn split_target(&self) -> Result<(Tensor, Tensor)> {
        let seq_len = self.captions.dim(1)?;
        if seq_len < 2 {
            candle_core::bail!("caption length {} too short to split", seq_len);
        }
        let target_input = self.captions.narrow(1, 0, seq_len - 1)?.contiguous()?;
        let target_real = self.captions.narrow(1, 1, seq_len - 1)?.contiguous()?;
        Ok((target_input, target_real))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Generic data loader trait
pub trait BatchDataLoader {
    /// Get next batch, `None` at the end of the epoch
    fn next_batch(&mut self, device: &Device) -> Result<Option<CaptionBatch>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}
