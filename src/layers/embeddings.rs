/// Token embedding whose matrix can be shared with the output projection
use candle_core::{Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};

pub struct TokenEmbedding {
    embedding: Embedding,
    hidden_size: usize,
}

impl TokenEmbedding {
    pub fn new(vocab_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(vocab_size, hidden_size, vb)?;
        Ok(Self {
            embedding,
            hidden_size,
        })
    }

    /// Look up token ids [batch, seq_len] -> [batch, seq_len, hidden_size]
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.embedding.forward(input)
    }

    /// Embedding matrix [vocab_size, hidden_size]
    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
