/// Epoch statistics, perplexity and the on-disk performance logs
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Losses above this are clamped before exponentiation
pub const MAX_LOG_PERPLEXITY: f64 = 100.0;

/// `exp(min(loss, 100))`
pub fn perplexity(loss: f64) -> f64 {
    loss.min(MAX_LOG_PERPLEXITY).exp()
}

/// Aggregate of one training or validation epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Loss per non-padding token
    pub loss: f64,
    /// Fraction of non-padding tokens predicted exactly
    pub accuracy: f64,
    pub n_word: usize,
    pub n_batches: usize,
}

impl EpochStats {
    /// Build from summed loss and token counts; empty epochs report zeros
    pub fn from_totals(total_loss: f64, n_word: usize, n_correct: usize, n_batches: usize) -> Self {
        let (loss, accuracy) = if n_word == 0 {
            (0.0, 0.0)
        } else {
            (total_loss / n_word as f64, n_correct as f64 / n_word as f64)
        };

        Self {
            loss,
            accuracy,
            n_word,
            n_batches,
        }
    }

    pub fn perplexity(&self) -> f64 {
        perplexity(self.loss)
    }
}

/// Console line for one phase of an epoch
pub fn format_performance(header: &str, ppl: f64, accuracy: f64, elapsed: Duration, lr: f64) -> String {
    format!(
        "  - {:12} ppl: {:8.5}, accuracy: {:3.3} %, lr: {:8.5}, elapse: {:3.3} min",
        header,
        ppl,
        100.0 * accuracy,
        lr,
        elapsed.as_secs_f64() / 60.0
    )
}

const LOG_HEADER: &str = "epoch,loss,ppl,accuracy";

/// `train.log` / `valid.log` CSV files
pub struct PerformanceLog {
    train_path: PathBuf,
    valid_path: PathBuf,
}

impl PerformanceLog {
    /// Truncate both files and write the header row
    pub fn create<P: AsRef<Path>>(logs_dir: P) -> Result<Self> {
        let dir = logs_dir.as_ref();
        fs::create_dir_all(dir)?;

        let log = Self {
            train_path: dir.join("train.log"),
            valid_path: dir.join("valid.log"),
        };

        for path in [&log.train_path, &log.valid_path] {
            let mut file = File::create(path)?;
            writeln!(file, "{}", LOG_HEADER)?;
        }

        Ok(log)
    }

    pub fn train_path(&self) -> &Path {
        &self.train_path
    }

    pub fn valid_path(&self) -> &Path {
        &self.valid_path
    }

    pub fn append_train(&self, epoch: usize, stats: &EpochStats) -> Result<()> {
        append_row(&self.train_path, epoch, stats)
    }

    pub fn append_valid(&self, epoch: usize, stats: &EpochStats) -> Result<()> {
        append_row(&self.valid_path, epoch, stats)
    }
}

fn append_row(path: &Path, epoch: usize, stats: &EpochStats) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    writeln!(
        file,
        "{},{:8.5},{:8.5},{:3.3}",
        epoch,
        stats.loss,
        stats.perplexity(),
        100.0 * stats.accuracy
    )?;
    Ok(())
}

/// One dashboard record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub tag: String,
    pub step: usize,
    pub value: f64,
}

/// Dashboard writer: one JSON scalar record per line
pub struct ScalarWriter {
    path: PathBuf,
}

impl ScalarWriter {
    pub fn create<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        fs::create_dir_all(log_dir.as_ref())?;
        let path = log_dir.as_ref().join("scalars.jsonl");
        File::create(&path)?;
        Ok(Self { path })
    }

    pub fn add_scalar(&self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write_records(&[ScalarRecord {
            tag: tag.to_string(),
            step,
            value,
        }])
    }

    /// Records `main_tag/name` for every pair
    pub fn add_scalars(&self, main_tag: &str, values: &[(&str, f64)], step: usize) -> Result<()> {
        let records: Vec<ScalarRecord> = values
            .iter()
            .map(|(name, value)| ScalarRecord {
                tag: format!("{}/{}", main_tag, name),
                step,
                value: *value,
            })
            .collect();
        self.write_records(&records)
    }

    fn write_records(&self, records: &[ScalarRecord]) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
