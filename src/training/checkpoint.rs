/// Model checkpointing with safetensors
use std::fs;
use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, RunConfig, SaveMode};
use crate::{CaptionError, Result};

/// File written by [`SaveMode::Best`]
pub const BEST_CHECKPOINT: &str = "model.safetensors";

/// Checkpoint metadata, stored next to the weights as `<file>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Epoch that produced the checkpoint
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub step: u64,
    /// Learning rate at checkpoint
    pub lr: f64,
    /// Monitored loss per word
    pub loss: f64,
    /// Monitored accuracy
    pub accuracy: f64,
    /// Run configuration
    pub settings: Option<RunConfig>,
    /// Model hyperparameters
    pub model: Option<ModelConfig>,
}

/// JSON sidecar path for a weights file
pub fn metadata_path<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref().with_extension("json")
}

/// Save every variable plus the metadata sidecar
///
/// # Arguments
/// * `varmap` - Model variables
/// * `path` - Path of the `.safetensors` file
/// * `metadata` - Checkpoint metadata
pub fn save_checkpoint<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    varmap.save(path)?;
    fs::write(metadata_path(path), serde_json::to_string_pretty(metadata)?)?;

    Ok(())
}

/// Load weights into an existing varmap
///
/// Every variable of `varmap` must be present in the file. Tensors the model
/// does not know are ignored with a warning.
///
/// # Returns
/// The metadata sidecar, or defaults when there is none
pub fn load_checkpoint<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> Result<CheckpointMetadata> {
    let path = path.as_ref();

    let stored = inspect(path)?;
    {
        let vars = varmap
            .data()
            .lock()
            .map_err(|e| CaptionError::Training(format!("varmap lock poisoned: {}", e)))?;
        for (name, _) in stored.iter().filter(|(name, _)| !vars.contains_key(name)) {
            log::warn!("Checkpoint tensor {} has no matching variable", name);
        }
    }

    varmap.load(path)?;

    let sidecar = metadata_path(path);
    let metadata = if sidecar.exists() {
        serde_json::from_str(&fs::read_to_string(&sidecar)?)?
    } else {
        log::warn!("No metadata found at {:?}", sidecar);
        CheckpointMetadata::default()
    };

    log::info!(
        "Loaded {} tensors from {:?} (epoch {}, step {})",
        stored.len(),
        path,
        metadata.epoch,
        metadata.step
    );

    Ok(metadata)
}

/// Names and shapes of the tensors stored in a checkpoint, sorted by name
pub fn inspect<P: AsRef<Path>>(path: P) -> Result<Vec<(String, Vec<usize>)>> {
    let data = fs::read(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&data).map_err(|e| {
        CaptionError::Data(format!("invalid checkpoint {:?}: {}", path.as_ref(), e))
    })?;

    let mut shapes: Vec<(String, Vec<usize>)> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| (name, view.shape().to_vec()))
        .collect();
    shapes.sort();

    Ok(shapes)
}

/// Applies the configured [`SaveMode`] at the end of every epoch
pub struct CheckpointManager {
    save_dir: PathBuf,
    mode: SaveMode,
    best_loss: Option<f64>,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(save_dir: P, mode: SaveMode) -> Self {
        Self {
            save_dir: save_dir.into(),
            mode,
            best_loss: None,
        }
    }

    /// Start from a loss already reached, e.g. by a resumed checkpoint
    pub fn with_best_loss(mut self, best_loss: Option<f64>) -> Self {
        self.best_loss = best_loss;
        self
    }

    /// Save if the mode asks for it
    ///
    /// `Best` writes when `metadata.loss` is no worse than every loss seen so
    /// far, `All` writes every epoch under a name carrying the accuracy.
    ///
    /// # Returns
    /// Path of the written checkpoint, if any
    pub fn on_epoch_end(
        &mut self,
        varmap: &VarMap,
        metadata: &CheckpointMetadata,
    ) -> Result<Option<PathBuf>> {
        let path = match self.mode {
            SaveMode::None => return Ok(None),
            SaveMode::All => self
                .save_dir
                .join(format!("model_accu_{:3.3}.safetensors", 100.0 * metadata.accuracy)),
            SaveMode::Best => {
                let improved = self.best_loss.map_or(true, |best| metadata.loss <= best);
                self.best_loss = Some(self.best_loss.map_or(metadata.loss, |b| b.min(metadata.loss)));
                if !improved {
                    return Ok(None);
                }
                self.save_dir.join(BEST_CHECKPOINT)
            }
        };

        save_checkpoint(varmap, &path, metadata)?;
        log::info!("Checkpoint saved to {:?}", path);

        Ok(Some(path))
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }
}
