pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod timer;
pub mod trainer;

pub use config::{TrainingConfig, TrainingError};
pub use data::{DeviceBatch, EvalPipeline, PrefetchConfig, PrefetchLoader};
pub use logging::{init_logging, Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossReduction, ModelWithLoss};
pub use metrics::{Accuracy, Metric, MetricHistory};
pub use optimizer::{BaseOptimizer, HyperParameters, ScheduledOptimizer, Sgd, SgdConfig};
pub use scheduler::{change_scale, piecewise, ChangeScale, Piecewise, Schedule, SchedulerConfig};
pub use timer::Timer;
pub use trainer::{
    select_device, steps_per_epoch, EpochSummary, EvalOutcome, Report, Trainer, TrainerSettings,
    TrainerState,
};
