use candle_core::{DType, Tensor, D};

use crate::{loss::to_runtime_error, TrainingError};

/// A named `(logits, targets) -> scalar` function evaluated per batch.
pub trait Metric: Send {
    fn name(&self) -> String;

    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<f64, TrainingError>;
}

/// Fraction of samples whose target is among the `top_k` highest logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accuracy {
    top_k: usize,
}

impl Accuracy {
    pub fn new(top_k: usize) -> Result<Self, TrainingError> {
        if top_k == 0 {
            return Err(TrainingError::configuration("top-k accuracy needs k > 0"));
        }
        Ok(Self { top_k })
    }

    pub fn top1() -> Self {
        Self { top_k: 1 }
    }
}

impl Metric for Accuracy {
    fn name(&self) -> String {
        format!("top{}", self.top_k)
    }

    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<f64, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(to_runtime_error)?;
        if batch == 0 {
            return Err(TrainingError::configuration("accuracy of an empty batch"));
        }
        if self.top_k > classes {
            return Err(TrainingError::configuration(format!(
                "top-{} accuracy with only {} classes",
                self.top_k, classes
            )));
        }
        let targets = targets
            .to_device(logits.device())
            .and_then(|t| t.to_dtype(DType::U32))
            .map_err(to_runtime_error)?;

        let hits = if self.top_k == 1 {
            logits
                .argmax(D::Minus1)
                .and_then(|pred| pred.eq(&targets))
                .and_then(|hits| hits.to_dtype(DType::F32))
        } else {
            logits
                .to_dtype(DType::F32)
                .and_then(|l| l.arg_sort_last_dim(false))
                .and_then(|order| order.narrow(1, 0, self.top_k))
                .and_then(|top| {
                    let expected = targets.unsqueeze(1)?.broadcast_as((batch, self.top_k))?;
                    top.eq(&expected)
                })
                .and_then(|hits| hits.to_dtype(DType::F32))
                .and_then(|hits| hits.sum(1))
        }
        .map_err(to_runtime_error)?;

        let correct = hits
            .sum_all()
            .and_then(|c| c.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        Ok(correct as f64 / batch as f64)
    }
}

/// Per-batch metric values, averaged per epoch and then discarded.
#[derive(Debug, Clone, Default)]
pub struct MetricHistory {
    series: Vec<(String, Vec<f64>)>,
}

impl MetricHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, name: &str, value: f64) {
        match self.series.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value),
            None => self.series.push((name.to_string(), vec![value])),
        }
    }

    /// Arithmetic mean of everything recorded under `name`.
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.series
            .iter()
            .find(|(n, _)| n == name)
            .filter(|(_, values)| !values.is_empty())
            .map(|(_, values)| values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Means in the order metrics were first recorded.
    pub fn averages(&self) -> Vec<(String, f64)> {
        self.series
            .iter()
            .filter_map(|(name, _)| self.mean(name).map(|mean| (name.clone(), mean)))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.series
            .iter()
            .find(|(n, _)| n == name)
            .map_or(0, |(_, values)| values.len())
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}
