use candle_core::{backprop::GradStore, DType, Tensor, Var};

use super::{BaseOptimizer, HyperParameters};
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl From<HyperParameters> for SgdConfig {
    fn from(hyper: HyperParameters) -> Self {
        Self {
            learning_rate: 0.0,
            momentum: hyper.momentum,
            weight_decay: hyper.weight_decay,
            nesterov: hyper.nesterov,
        }
    }
}

/// Stochastic gradient descent with momentum, L2 weight decay and optional
/// Nesterov momentum.
///
/// Update per parameter, with `d = g + wd * p`:
/// `buf = d` on the first step, `buf = m * buf + d` afterwards;
/// the applied direction is `d + m * buf` with Nesterov, `buf` without;
/// `p -= lr * direction`. Reduced-precision parameters are updated through an
/// `f32` master copy.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    params: Vec<ParameterSlot>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Tensor>,
    momentum_buffer: Option<Tensor>,
}

impl Sgd {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: SgdConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::configuration(
                "optimizer requires at least one parameter",
            ));
        }
        if config.nesterov && config.momentum <= 0.0 {
            return Err(TrainingError::configuration(
                "nesterov momentum requires momentum > 0",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::configuration(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let dtype = tensor.dtype();
            let master = if dtype != DType::F32 {
                Some(tensor.to_dtype(DType::F32)?.detach())
            } else {
                None
            };
            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                momentum_buffer: None,
            });
        }

        Ok(Self { config, params })
    }

    /// Constructor matching the base-optimizer seam of the scheduled optimizer.
    pub fn from_hyper(
        named_parameters: Vec<(String, Var)>,
        hyper: HyperParameters,
    ) -> Result<Self, TrainingError> {
        Self::new(named_parameters, SgdConfig::from(hyper))
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|slot| slot.name.as_str())
    }
}

impl BaseOptimizer for Sgd {
    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        let cfg = self.config;
        for slot in &mut self.params {
            let grad = match grads.get(slot.param.as_tensor()) {
                Some(grad) => grad.to_dtype(DType::F32)?,
                None => continue,
            };

            let base = match slot.master.as_ref() {
                Some(master) => master.clone(),
                None => slot.param.as_tensor().detach(),
            };

            let mut direction = if cfg.weight_decay != 0.0 {
                (grad + base.affine(cfg.weight_decay, 0.0)?)?
            } else {
                grad
            };

            if cfg.momentum != 0.0 {
                let buffer = match slot.momentum_buffer.take() {
                    Some(prev) => (prev.affine(cfg.momentum, 0.0)? + &direction)?,
                    None => direction.clone(),
                };
                direction = if cfg.nesterov {
                    (direction + buffer.affine(cfg.momentum, 0.0)?)?
                } else {
                    buffer.clone()
                };
                slot.momentum_buffer = Some(buffer);
            }

            let next = (base - direction.affine(cfg.learning_rate, 0.0)?)?;
            if slot.dtype == DType::F32 {
                slot.param.set(&next)?;
            } else {
                slot.param.set(&next.to_dtype(slot.dtype)?)?;
                slot.master = Some(next);
            }
        }
        Ok(())
    }
}
