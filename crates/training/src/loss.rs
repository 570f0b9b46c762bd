use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::Classifier;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// How per-sample losses are collapsed before backpropagation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReduction {
    #[default]
    Sum,
    Mean,
}

impl LossReduction {
    pub fn reduce(self, per_sample: &Tensor) -> Result<Tensor, TrainingError> {
        let reduced = match self {
            LossReduction::Sum => per_sample.sum_all(),
            LossReduction::Mean => per_sample.mean_all(),
        };
        reduced.map_err(to_runtime_error)
    }
}

/// Cross entropy without reduction: one `f32` loss per sample.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::configuration(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    /// `logits` is `(batch, classes)`, `targets` is `(batch,)`; returns `(batch,)`.
    pub fn per_sample(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::configuration(format!(
                "cross entropy expects (batch, classes) logits, got {:?}",
                logits.dims()
            ))
        })?;
        if classes == 0 {
            return Err(TrainingError::configuration(
                "logits class dimension must be greater than zero",
            ));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::configuration(format!(
                "targets shape {:?} does not match {} logits rows",
                targets.dims(),
                batch
            )));
        }

        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;

        let targets = targets
            .to_device(logits.device())
            .and_then(|t| t.to_dtype(DType::U32))
            .map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;

        if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let smoothed = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let uniform = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (smoothed + uniform).map_err(to_runtime_error)
        } else {
            Ok(nll)
        }
    }
}

/// A classifier bundled with its criterion. The loop chooses the reduction.
pub struct ModelWithLoss<M> {
    model: M,
    criterion: CrossEntropyLoss,
}

impl<M: Classifier> ModelWithLoss<M> {
    pub fn new(model: M, criterion: CrossEntropyLoss) -> Self {
        Self { model, criterion }
    }

    /// Returns `(logits, per_sample_loss)`.
    pub fn forward(
        &self,
        inputs: &Tensor,
        targets: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor), TrainingError> {
        let logits = self
            .model
            .forward_t(inputs, train)
            .map_err(to_runtime_error)?;
        let loss = self.criterion.per_sample(&logits, targets)?;
        Ok((logits, loss))
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
