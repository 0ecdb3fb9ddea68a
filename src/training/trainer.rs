/// Training loop for the caption transformer
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use super::checkpoint::{load_checkpoint, CheckpointManager, CheckpointMetadata};
use super::loss::cal_performance;
use super::metrics::{format_performance, EpochStats, PerformanceLog, ScalarWriter};
use super::scheduler::ScheduledOptimizer;
use crate::config::{ModelConfig, RunConfig};
use crate::data::BatchDataLoader;
use crate::models::{CaptionTransformer, SequenceModel};
use crate::{Result, PAD_IDX};

/// Adam settings of the transformer recipe
pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.98;
pub const ADAM_EPS: f64 = 1e-9;

/// Outcome of one epoch of [`Trainer::train`]
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochStats,
    pub valid: Option<EpochStats>,
    /// Rate after the last update of the epoch
    pub learning_rate: f64,
    pub checkpoint: Option<PathBuf>,
}

/// Drives epochs of teacher-forced training over a [`SequenceModel`]
pub struct Trainer<M: SequenceModel, O: Optimizer> {
    model: M,
    model_config: Option<ModelConfig>,
    /// Monitored loss of the checkpoint training resumed from
    best_loss: Option<f64>,
    varmap: VarMap,
    optimizer: ScheduledOptimizer<O>,
    config: RunConfig,
    device: Device,
}

impl Trainer<CaptionTransformer, AdamW> {
    /// Create a caption transformer and its scheduled Adam optimizer
    ///
    /// Resumes weights and the schedule position when `RESUME_FROM` is set.
    pub fn build(model_config: ModelConfig, config: RunConfig, device: Device) -> Result<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = CaptionTransformer::new(model_config.clone(), vb)?;

        let resumed = match &config.resume_from {
            Some(path) => {
                log::info!("Resuming from {:?}", path);
                Some(load_checkpoint(&mut varmap, path)?)
            }
            None => None,
        };
        let n_steps = resumed.as_ref().map_or(0, |metadata| metadata.step);

        // The scheduled rate replaces the default on construction
        let optimizer_params = ParamsAdamW {
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPS,
            weight_decay: 0.0,
            ..Default::default()
        };
        let adam = AdamW::new(varmap.all_vars(), optimizer_params)?;
        let optimizer =
            ScheduledOptimizer::new(adam, config.lr_mul, config.d_model, config.warmup_step)
                .with_n_steps(n_steps);

        log::info!(
            "Model parameters: {}",
            crate::utils::count_parameters(&varmap)
        );

        let mut trainer =
            Self::new(model, varmap, optimizer, config, device).with_model_config(model_config);
        trainer.best_loss = resumed.map(|metadata| metadata.loss);
        Ok(trainer)
    }
}

impl<M: SequenceModel, O: Optimizer> Trainer<M, O> {
    /// Create new trainer
    ///
    /// `varmap` must hold the variables `optimizer` updates; it is what
    /// checkpoints save.
    pub fn new(
        model: M,
        varmap: VarMap,
        optimizer: ScheduledOptimizer<O>,
        config: RunConfig,
        device: Device,
    ) -> Self {
        Self {
            model,
            model_config: None,
            best_loss: None,
            varmap,
            optimizer,
            config,
            device,
        }
    }

    /// Store model hyperparameters in checkpoint metadata
    pub fn with_model_config(mut self, model_config: ModelConfig) -> Self {
        self.model_config = Some(model_config);
        self
    }

    /// Train for one epoch
    ///
    /// Stops early after `MAX_BATCHES_PER_EPOCH` batches when set.
    ///
    /// # Returns
    /// Loss per non-padding word and token accuracy over the epoch
    pub fn train_epoch(&mut self, loader: &mut dyn BatchDataLoader) -> Result<EpochStats> {
        let mut total_loss = 0.0;
        let mut n_word_total = 0;
        let mut n_correct_total = 0;
        let mut n_batches = 0;

        loader.reset();

        while let Some(batch) = loader.next_batch(&self.device)? {
            let (trg_input, gold) = batch.split_target()?;

            self.optimizer.zero_grad();
            let pred = self.model.forward_t(&batch.images, &trg_input, true)?;
            let perf = cal_performance(
                &pred.permute((0, 2, 1))?,
                &gold,
                PAD_IDX,
                self.config.label_smoothing,
            )?;
            self.optimizer.backward(&perf.loss_per_word)?;
            let lr = self.optimizer.step_and_update_lr()?;

            let loss = perf.loss_per_word_value()?;
            total_loss += loss * perf.n_word as f64;
            n_word_total += perf.n_word;
            n_correct_total += perf.n_correct;
            n_batches += 1;

            log::debug!(
                "Step {}: loss={:.4}, words={}, lr={:.6}",
                self.optimizer.n_steps(),
                loss,
                perf.n_word,
                lr
            );

            if self.config.max_batches_per_epoch == Some(n_batches) {
                log::debug!("Batch limit of {} reached", n_batches);
                break;
            }
        }

        Ok(EpochStats::from_totals(
            total_loss,
            n_word_total,
            n_correct_total,
            n_batches,
        ))
    }

    /// Score one pass over the validation data
    ///
    /// Dropout is off and nothing is back-propagated: parameters and the
    /// step counter are left as they were.
    pub fn eval_epoch(&mut self, loader: &mut dyn BatchDataLoader) -> Result<EpochStats> {
        let mut total_loss = 0.0;
        let mut n_word_total = 0;
        let mut n_correct_total = 0;
        let mut n_batches = 0;

        loader.reset();

        while let Some(batch) = loader.next_batch(&self.device)? {
            let (trg_input, gold) = batch.split_target()?;

            let pred = self.model.forward_t(&batch.images, &trg_input, false)?;
            let perf = cal_performance(
                &pred.permute((0, 2, 1))?,
                &gold,
                PAD_IDX,
                self.config.label_smoothing,
            )?;

            total_loss += perf.loss_per_word_value()? * perf.n_word as f64;
            n_word_total += perf.n_word;
            n_correct_total += perf.n_correct;
            n_batches += 1;
        }

        Ok(EpochStats::from_totals(
            total_loss,
            n_word_total,
            n_correct_total,
            n_batches,
        ))
    }

    /// Full training loop
    ///
    /// Runs `EPOCHS` epochs, validating after each one when a validation
    /// loader is given. Writes log rows, dashboard scalars and checkpoints as
    /// configured.
    pub fn train(
        &mut self,
        train_loader: &mut dyn BatchDataLoader,
        mut valid_loader: Option<&mut dyn BatchDataLoader>,
    ) -> Result<Vec<EpochRecord>> {
        log::info!("Starting training for {} epochs", self.config.epochs);
        log::info!("Total batches per epoch: {}", train_loader.num_batches());

        let performance_log = PerformanceLog::create(&self.config.logs_dir)?;
        let scalars = if self.config.tensor_board {
            Some(ScalarWriter::create(self.config.logs_dir.join("tensorboard"))?)
        } else {
            None
        };
        let mut checkpoints = CheckpointManager::new(&self.config.save_dir, self.config.save_mode)
            .with_best_loss(self.best_loss);

        let mut records = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            println!("[ Epoch {}]", epoch);

            let start = Instant::now();
            let train_stats = self.train_epoch(train_loader)?;
            let lr = self.optimizer.learning_rate();
            println!(
                "{}",
                format_performance(
                    "Training",
                    train_stats.perplexity(),
                    train_stats.accuracy,
                    start.elapsed(),
                    lr
                )
            );

            let valid_stats = match valid_loader.as_deref_mut() {
                Some(loader) => {
                    let start = Instant::now();
                    let stats = self.eval_epoch(loader)?;
                    println!(
                        "{}",
                        format_performance(
                            "Validation",
                            stats.perplexity(),
                            stats.accuracy,
                            start.elapsed(),
                            lr
                        )
                    );
                    Some(stats)
                }
                None => None,
            };

            let monitored = valid_stats.unwrap_or(train_stats);
            let metadata = CheckpointMetadata {
                epoch,
                step: self.optimizer.n_steps(),
                lr,
                loss: monitored.loss,
                accuracy: monitored.accuracy,
                settings: Some(self.config.clone()),
                model: self.model_config.clone(),
            };
            let checkpoint = checkpoints.on_epoch_end(&self.varmap, &metadata)?;

            performance_log.append_train(epoch, &train_stats)?;
            if let Some(stats) = &valid_stats {
                performance_log.append_valid(epoch, stats)?;
            }

            if let Some(writer) = &scalars {
                let mut ppl = vec![("train", train_stats.perplexity())];
                let mut accuracy = vec![("train", 100.0 * train_stats.accuracy)];
                if let Some(stats) = &valid_stats {
                    ppl.push(("val", stats.perplexity()));
                    accuracy.push(("val", 100.0 * stats.accuracy));
                }
                writer.add_scalars("ppl", &ppl, epoch)?;
                writer.add_scalars("accuracy", &accuracy, epoch)?;
                writer.add_scalar("learning_rate", lr, epoch)?;
            }

            log::info!(
                "Epoch {} complete: loss={:.4}, step={}",
                epoch,
                train_stats.loss,
                self.optimizer.n_steps()
            );

            records.push(EpochRecord {
                epoch,
                train: train_stats,
                valid: valid_stats,
                learning_rate: lr,
                checkpoint,
            });
        }

        log::info!("Training complete!");

        Ok(records)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &ScheduledOptimizer<O> {
        &self.optimizer
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }
}
