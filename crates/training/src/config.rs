use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use cifar_data::DataError;
use serde::{Deserialize, Serialize};

use crate::loss::LossReduction;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelOverrides,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if let Some(0) = self.data.eval_batch_size {
            errors.push("data.eval_batch_size must be greater than 0".to_string());
        }
        if self.data.num_workers == 0 {
            errors.push("data.num_workers must be greater than 0".to_string());
        }
        if self.data.prefetch_depth == 0 {
            errors.push("data.prefetch_depth must be greater than 0".to_string());
        }
        if self.data.crop == 0 || self.data.crop > 32 + 2 * self.data.pad {
            errors.push(format!(
                "data.crop must be in [1, {}] for pad {}",
                32 + 2 * self.data.pad,
                self.data.pad
            ));
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if self.optimizer.nesterov && self.optimizer.momentum <= 0.0 {
            errors.push("optimizer.nesterov requires momentum > 0".to_string());
        }

        let breakpoints = self.scheduler.resolved_breakpoints(self.runtime.epochs);
        if breakpoints.len() != self.scheduler.values.len() {
            errors.push(format!(
                "scheduler has {} breakpoints but {} values",
                breakpoints.len(),
                self.scheduler.values.len()
            ));
        }
        if self.scheduler.values.is_empty() {
            errors.push("scheduler.values must not be empty".to_string());
        }
        if breakpoints.windows(2).any(|pair| pair[0] >= pair[1]) {
            errors.push("scheduler breakpoints must be strictly increasing".to_string());
        }
        if self
            .scheduler
            .values
            .iter()
            .any(|value| !value.is_finite() || *value < 0.0)
        {
            errors.push("scheduler.values must be finite and >= 0".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        for (name, value) in [
            ("model.stem_channels", self.model.stem_channels),
            ("model.stage1_channels", self.model.stage1_channels),
            ("model.stage2_channels", self.model.stage2_channels),
            ("model.head_channels", self.model.head_channels),
        ] {
            if let Some(0) = value {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.root, base);
        if let Some(dir) = self.runtime.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Evaluation batch size; half the training batch unless set explicitly.
    pub fn eval_batch_size(&self) -> usize {
        self.data
            .eval_batch_size
            .unwrap_or((self.data.batch_size / 2).max(1))
    }

    /// Weight decay handed to the optimizer, scaled by the batch size when the
    /// configured value is per sample.
    pub fn effective_weight_decay(&self) -> f64 {
        if self.scheduler.per_sample_scaling {
            self.optimizer.weight_decay * self.data.batch_size as f64
        } else {
            self.optimizer.weight_decay
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub stem_channels: Option<usize>,
    #[serde(default)]
    pub stage1_channels: Option<usize>,
    #[serde(default)]
    pub stage2_channels: Option<usize>,
    #[serde(default)]
    pub head_channels: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub eval_batch_size: Option<usize>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_depth")]
    pub prefetch_depth: usize,
    #[serde(default = "default_pad")]
    pub pad: usize,
    #[serde(default = "default_crop")]
    pub crop: usize,
    #[serde(default = "default_cutout")]
    pub cutout: usize,
    #[serde(default = "default_true")]
    pub tta: bool,
    #[serde(default)]
    pub download: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: default_data_root(),
            batch_size: default_batch_size(),
            eval_batch_size: None,
            num_workers: default_num_workers(),
            prefetch_depth: default_prefetch_depth(),
            pad: default_pad(),
            crop: default_crop(),
            cutout: default_cutout(),
            tta: true,
            download: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Per-sample value when `scheduler.per_sample_scaling` is set.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_true")]
    pub nesterov: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            nesterov: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Epoch positions of the control points; defaults to `[0, 4, epochs]`,
    /// with the peak pulled in proportionally for runs of four epochs or fewer.
    #[serde(default)]
    pub breakpoints: Option<Vec<f64>>,
    #[serde(default = "default_schedule_values")]
    pub values: Vec<f64>,
    /// Divide the schedule by the batch size (the loss is summed, not averaged).
    #[serde(default = "default_true")]
    pub per_sample_scaling: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            breakpoints: None,
            values: default_schedule_values(),
            per_sample_scaling: true,
        }
    }
}

impl SchedulerConfig {
    pub fn resolved_breakpoints(&self, epochs: usize) -> Vec<f64> {
        self.breakpoints.clone().unwrap_or_else(|| {
            let end = epochs as f64;
            let peak = if end > 4.0 { 4.0 } else { end * 4.0 / 25.0 };
            vec![0.0, peak, end]
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub loss_reduction: LossReduction,
    #[serde(default)]
    pub label_smoothing: f32,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            warmup_steps: default_warmup_steps(),
            seed: default_seed(),
            precision: Precision::default(),
            device: DeviceKind::default(),
            loss_reduction: LossReduction::default(),
            label_smoothing: 0.0,
            tensorboard_dir: None,
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    /// Half precision weights and activations, `f32` batch norm.
    Fp16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// First CUDA or Metal device if one is available, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_batch_size() -> usize {
    500
}

fn default_num_workers() -> usize {
    8
}

fn default_prefetch_depth() -> usize {
    1
}

fn default_pad() -> usize {
    4
}

fn default_crop() -> usize {
    32
}

fn default_cutout() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    5e-4
}

fn default_schedule_values() -> Vec<f64> {
    vec![0.025, 0.4, 0.0001]
}

fn default_epochs() -> usize {
    25
}

fn default_warmup_steps() -> usize {
    2
}

fn default_seed() -> u64 {
    42
}

fn default_log_every_n_steps() -> usize {
    50
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    /// Invalid construction argument, raised before any work is done.
    Configuration(String),
    /// A finite source ran dry where a batch was required.
    DataExhausted(String),
    Data(DataError),
    Runtime(String),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn data_exhausted(message: impl Into<String>) -> Self {
        Self::DataExhausted(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "I/O error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            TrainingError::DataExhausted(msg) => write!(f, "data exhausted: {}", msg),
            TrainingError::Data(err) => write!(f, "data pipeline failed: {}", err),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Data(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Configuration(_)
            | TrainingError::DataExhausted(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<DataError> for TrainingError {
    fn from(value: DataError) -> Self {
        TrainingError::Data(value)
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
    }
}
