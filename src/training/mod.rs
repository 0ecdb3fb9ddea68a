/// Training infrastructure for the caption transformer
pub mod checkpoint;
pub mod loss;
pub mod metrics;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointManager, CheckpointMetadata};
pub use loss::{cal_loss, cal_performance, Performance};
pub use metrics::{perplexity, EpochStats, PerformanceLog, ScalarWriter};
pub use scheduler::{ScheduleConfig, ScheduledOptimizer};
pub use trainer::{EpochRecord, Trainer};
