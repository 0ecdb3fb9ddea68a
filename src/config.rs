/// Configuration for the caption transformer and the training run
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::{CaptionError, Result};

/// Section merged over every dataset section
pub const PARAMS_SECTION: &str = "PARAMS";

/// Model hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Target vocabulary size (number of output classes)
    pub vocab_size: usize,

    /// Width of one image region feature vector
    pub feature_dim: usize,

    /// Embedding/hidden dimension
    pub d_model: usize,

    /// Position-wise feed-forward inner dimension
    pub d_inner: usize,

    /// Number of encoder layers and of decoder layers
    pub n_layers: usize,

    /// Number of attention heads
    pub n_head: usize,

    /// Per-head query/key dimension
    pub d_k: usize,

    /// Per-head value dimension
    pub d_v: usize,

    /// Dropout probability
    pub dropout: f32,

    /// Size of the sinusoidal position table
    pub n_position: usize,

    /// Share the target embedding matrix with the output projection
    pub trg_emb_prj_weight_sharing: bool,

    /// Padding index of the target vocabulary
    pub trg_pad_idx: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 5001,
            feature_dim: 2048,
            d_model: 512,
            d_inner: 2048,
            n_layers: 1,
            n_head: 8,
            d_k: 64,
            d_v: 64,
            dropout: 0.1,
            n_position: 200,
            trg_emb_prj_weight_sharing: true,
            trg_pad_idx: crate::PAD_IDX,
        }
    }
}

impl ModelConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 || self.d_inner == 0 {
            return Err(CaptionError::Config(
                "d_model and d_inner must be > 0".to_string(),
            ));
        }

        if self.n_head == 0 || self.d_k == 0 || self.d_v == 0 {
            return Err(CaptionError::Config(
                "n_head, d_k and d_v must be > 0".to_string(),
            ));
        }

        if self.n_layers == 0 {
            return Err(CaptionError::Config("n_layers must be > 0".to_string()));
        }

        if self.vocab_size < 2 {
            return Err(CaptionError::Config(format!(
                "vocab_size must be >= 2, got {}",
                self.vocab_size
            )));
        }

        if (self.trg_pad_idx as usize) >= self.vocab_size {
            return Err(CaptionError::Config(format!(
                "trg_pad_idx {} outside vocabulary of size {}",
                self.trg_pad_idx, self.vocab_size
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CaptionError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }

        Ok(())
    }
}

/// Checkpoint strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    /// Never write checkpoints
    #[default]
    None,
    /// Write one checkpoint per epoch, named after its accuracy
    All,
    /// Overwrite a single checkpoint whenever the monitored loss improves
    Best,
}

/// Run configuration: the selected dataset section merged with `PARAMS`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RunConfig {
    /// Directory of `<image name>.npy` feature files
    pub img_path: PathBuf,
    /// Caption text file (`<image>#<n>\t<caption>` lines)
    pub txt_path: PathBuf,
    /// Tokenizer cache, built from `txt_path` when missing
    pub cap_file: PathBuf,
    /// Image names of the training split, one per line
    pub img_name: PathBuf,
    pub dataset_name: String,

    /// Image names of the validation split
    #[serde(default)]
    pub val_img_name: Option<PathBuf>,

    pub batch_size: usize,
    pub epochs: usize,
    pub lr_mul: f64,
    pub d_model: usize,
    pub warmup_step: u64,

    #[serde(default)]
    pub tensor_board: bool,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,
    #[serde(default)]
    pub save_mode: SaveMode,

    /// Run the validation pass after every training epoch
    #[serde(default)]
    pub validate: bool,
    /// Caption length in tokens, `<start>` and `<end>` included
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Vocabulary size cap, special tokens excluded
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub label_smoothing: bool,
    /// Stop each training epoch after this many batches
    #[serde(default)]
    pub max_batches_per_epoch: Option<usize>,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    /// Checkpoint to resume weights and scheduler step from
    #[serde(default)]
    pub resume_from: Option<PathBuf>,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_max_length() -> usize {
    40
}

fn default_top_k() -> usize {
    5000
}

fn default_shuffle() -> bool {
    true
}

impl RunConfig {
    /// Load a YAML config file and select one dataset section
    pub fn from_yaml_file<P: AsRef<Path>>(path: P, dataset: &str) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {:?} (dataset {})", path, dataset);
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml, dataset)
    }

    /// Parse a YAML document; keys in `PARAMS` override the dataset section
    pub fn from_yaml_str(yaml: &str, dataset: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)?;

        let mut merged = section(&root, dataset)?;
        for (key, value) in section(&root, PARAMS_SECTION)? {
            merged.insert(key, value);
        }

        let config: RunConfig = serde_yaml::from_value(Value::Mapping(merged))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(CaptionError::Config("BATCH_SIZE must be > 0".to_string()));
        }

        if self.d_model == 0 {
            return Err(CaptionError::Config("D_MODEL must be > 0".to_string()));
        }

        if self.warmup_step == 0 {
            return Err(CaptionError::Config("WARMUP_STEP must be > 0".to_string()));
        }

        if !(self.lr_mul > 0.0) {
            return Err(CaptionError::Config(format!(
                "LR_MUL must be > 0, got {}",
                self.lr_mul
            )));
        }

        if self.max_length < 2 {
            return Err(CaptionError::Config(
                "MAX_LENGTH must leave room for <start> and <end>".to_string(),
            ));
        }

        if self.max_batches_per_epoch == Some(0) {
            return Err(CaptionError::Config(
                "MAX_BATCHES_PER_EPOCH must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Model configuration for this run
    ///
    /// The position table grows to cover `MAX_LENGTH` tokens.
    pub fn model_config(&self, vocab_size: usize, feature_dim: usize) -> ModelConfig {
        let defaults = ModelConfig::default();
        ModelConfig {
            vocab_size,
            feature_dim,
            d_model: self.d_model,
            n_position: defaults.n_position.max(self.max_length),
            ..defaults
        }
    }
}

fn section(root: &Value, name: &str) -> Result<Mapping> {
    root.get(name)
        .and_then(Value::as_mapping)
        .cloned()
        .ok_or_else(|| CaptionError::Config(format!("missing config section '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
FLICKER:
  IMG_PATH: data/flickr/features
  TXT_PATH: data/flickr/Flickr8k.token.txt
  CAP_FILE: data/flickr/tokenizer.json
  IMG_NAME: data/flickr/Flickr_8k.trainImages.txt
  DATASET_NAME: flickr8k
  BATCH_SIZE: 16
COCO:
  IMG_PATH: data/coco/features
  TXT_PATH: data/coco/captions.txt
  CAP_FILE: data/coco/tokenizer.json
  IMG_NAME: data/coco/train.txt
  DATASET_NAME: coco
PARAMS:
  BATCH_SIZE: 64
  EPOCHS: 20
  LR_MUL: 2.0
  D_MODEL: 512
  WARMUP_STEP: 4000
  TENSOR_BOARD: false
  LOGS_DIR: logs
  SAVE_DIR: checkpoints
  SAVE_MODE: best
"#;

    #[test]
    fn test_params_override_dataset_section() {
        let config = RunConfig::from_yaml_str(YAML, "FLICKER").unwrap();

        assert_eq!(config.dataset_name, "flickr8k");
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.epochs, 20);
        assert_eq!(config.warmup_step, 4000);
        assert_eq!(config.save_mode, SaveMode::Best);
        assert_eq!(config.img_path, PathBuf::from("data/flickr/features"));
    }

    #[test]
    fn test_defaults_for_optional_keys() {
        let config = RunConfig::from_yaml_str(YAML, "COCO").unwrap();

        assert!(!config.validate);
        assert!(!config.label_smoothing);
        assert!(config.shuffle);
        assert_eq!(config.max_batches_per_epoch, None);
        assert_eq!(config.max_length, 40);
        assert_eq!(config.top_k, 5000);
        assert!(config.val_img_name.is_none());
    }

    #[test]
    fn test_missing_dataset_section() {
        let err = RunConfig::from_yaml_str(YAML, "MSCOCO").unwrap_err();
        assert!(matches!(err, CaptionError::Config(_)));
    }

    #[test]
    fn test_zero_warmup_rejected() {
        let yaml = YAML.replace("WARMUP_STEP: 4000", "WARMUP_STEP: 0");
        let err = RunConfig::from_yaml_str(&yaml, "FLICKER").unwrap_err();
        assert!(matches!(err, CaptionError::Config(_)));
    }

    #[test]
    fn test_model_config_validation() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());

        let bad = ModelConfig {
            vocab_size: 1,
            ..ModelConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = ModelConfig {
            dropout: 1.0,
            ..ModelConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_run_model_config_uses_d_model() {
        let config = RunConfig::from_yaml_str(YAML, "FLICKER").unwrap();
        let model_config = config.model_config(1200, 2048);

        assert_eq!(model_config.d_model, 512);
        assert_eq!(model_config.vocab_size, 1200);
        assert_eq!(model_config.feature_dim, 2048);
        assert!(model_config.trg_emb_prj_weight_sharing);
        assert_eq!(model_config.n_position, 200);
    }

    #[test]
    fn test_long_captions_widen_position_table() {
        let yaml = YAML.replace("SAVE_MODE: best", "SAVE_MODE: best\n  MAX_LENGTH: 250");
        let config = RunConfig::from_yaml_str(&yaml, "FLICKER").unwrap();
        assert_eq!(config.max_length, 250);

        let model_config = config.model_config(1200, 2048);
        assert_eq!(model_config.n_position, 250);
        assert!(model_config.validate().is_ok());
    }
}
