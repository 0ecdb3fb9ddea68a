//! Caption Transformer - image captioning trainer
//!
//! Trains an encoder-decoder transformer that reads pre-extracted image
//! features and predicts caption tokens with teacher forcing.
//!
//! # Architecture
//!
//! - **Encoder**: projects image region features to `d_model` and runs
//!   self-attention layers over the regions
//! - **Decoder**: masked self-attention over caption tokens plus
//!   encoder-decoder attention
//! - **ScheduledOptimizer**: Adam wrapped in a warmup / inverse-sqrt
//!   learning-rate schedule
//!
//! # Example
//!
//! ```ignore
//! use caption_transformer::{RunConfig, training::Trainer};
//!
//! let config = RunConfig::from_yaml_file("config/config.yml", "FLICKER")?;
//! let model_config = config.model_config(tokenizer.vocab_size(), feature_dim);
//! let mut trainer = Trainer::build(model_config, config, device)?;
//! trainer.train(&mut train_loader, None)?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ModelConfig, RunConfig, SaveMode};
pub use models::CaptionTransformer;

/// Padding token index shared by the tokenizer, the decoder and the loss
pub const PAD_IDX: u32 = 0;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum CaptionError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Loss error: {0}")]
    Loss(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("NumPy read error: {0}")]
    Npy(#[from] ndarray_npy::ReadNpyError),
}

pub type Result<T> = std::result::Result<T, CaptionError>;
