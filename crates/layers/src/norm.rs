//! Batch normalisation over `(batch, channels, height, width)` activations.
//!
//! Statistics and the affine transform are always evaluated in the
//! normalisation dtype of the [`PrecisionPlan`] (`f32`); the output is cast
//! back to the incoming activation dtype. In training mode the batch statistics
//! are used and the running estimates are updated with `momentum`; in
//! evaluation mode the running estimates are used.

use candle_core::{Result, Tensor, Var};

use crate::{
    checks,
    dtypes::{cast_tensor, PrecisionPlan},
    init::LayerKind,
    join_name, NamedParameters,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    pub channels: usize,
    pub epsilon: f64,
    /// Weight given to the newest batch statistics in the running estimate.
    pub momentum: f64,
}

impl BatchNormConfig {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            epsilon: 1e-4,
            momentum: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    config: BatchNormConfig,
    weight: Var,
    bias: Var,
    running_mean: Var,
    running_var: Var,
}

impl BatchNorm2d {
    pub fn new(config: BatchNormConfig, plan: &PrecisionPlan) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.momentum) {
            candle_core::bail!("batch norm momentum must be in [0, 1], got {}", config.momentum);
        }
        let kind = LayerKind::BatchNorm {
            channels: config.channels,
        };
        let group = plan.group(&kind);
        let weight = kind.sample_weight(&group)?;
        let bias = Tensor::zeros(config.channels, group.dtype, &group.device)?;
        let running_mean = Tensor::zeros(config.channels, group.dtype, &group.device)?;
        let running_var = Tensor::ones(config.channels, group.dtype, &group.device)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
            running_mean: Var::from_tensor(&running_mean)?,
            running_var: Var::from_tensor(&running_var)?,
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn running_mean(&self) -> &Tensor {
        self.running_mean.as_tensor()
    }

    pub fn running_var(&self) -> &Tensor {
        self.running_var.as_tensor()
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_nchw("batch_norm", input, self.config.channels)?;
        let out_dtype = input.dtype();
        let stats_dtype = self.weight.dtype();
        let x = cast_tensor(input, stats_dtype)?;
        let channels = self.config.channels;

        let (mean, var) = if train {
            // (C, N*H*W) view so per-channel reductions run over one axis.
            let per_channel = x.transpose(0, 1)?.flatten_from(1)?;
            let count = per_channel.dim(1)?;
            let mean = per_channel.mean(1)?;
            let centered = per_channel.broadcast_sub(&mean.unsqueeze(1)?)?;
            let var = centered.sqr()?.mean(1)?;
            self.update_running_stats(&mean, &var, count)?;
            (mean, var)
        } else {
            (
                self.running_mean.as_tensor().clone(),
                self.running_var.as_tensor().clone(),
            )
        };

        let shape = (1, channels, 1, 1);
        let mean = mean.reshape(shape)?;
        let inv_std = (var + self.config.epsilon)?.sqrt()?.recip()?.reshape(shape)?;
        let normalized = x.broadcast_sub(&mean)?.broadcast_mul(&inv_std)?;
        let scaled = normalized
            .broadcast_mul(&self.weight.as_tensor().reshape(shape)?)?
            .broadcast_add(&self.bias.as_tensor().reshape(shape)?)?;
        cast_tensor(&scaled, out_dtype)
    }

    fn update_running_stats(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let correction = if count > 1 {
            count as f64 / (count - 1) as f64
        } else {
            1.0
        };
        let unbiased = var.detach().affine(correction, 0.0)?;
        let next_mean = (self.running_mean.as_tensor().affine(1.0 - momentum, 0.0)?
            + mean.detach().affine(momentum, 0.0)?)?;
        let next_var = (self.running_var.as_tensor().affine(1.0 - momentum, 0.0)?
            + unbiased.affine(momentum, 0.0)?)?;
        self.running_mean.set(&next_mean)?;
        self.running_var.set(&next_var)
    }
}

impl NamedParameters for BatchNorm2d {
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        out.push((join_name(prefix, "bias"), self.bias.clone()));
    }

    fn push_buffers(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "running_mean"), self.running_mean.clone()));
        out.push((join_name(prefix, "running_var"), self.running_var.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn input() -> Result<Tensor> {
        let data: Vec<f32> = (0..32).map(|v| v as f32).collect();
        Tensor::from_vec(data, (2, 2, 2, 4), &Device::Cpu)
    }

    #[test]
    fn training_output_is_standardised_per_channel() -> Result<()> {
        let norm = BatchNorm2d::new(BatchNormConfig::new(2), &PrecisionPlan::full_precision(Device::Cpu))?;
        let out = norm.forward_t(&input()?, true)?;
        let per_channel = out.transpose(0, 1)?.flatten_from(1)?;
        let means = per_channel.mean(1)?.to_vec1::<f32>()?;
        for mean in means {
            assert!(mean.abs() < 1e-4);
        }
        let vars = per_channel.sqr()?.mean(1)?.to_vec1::<f32>()?;
        for var in vars {
            assert!((var - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn running_stats_move_by_momentum_and_drive_eval() -> Result<()> {
        let norm = BatchNorm2d::new(BatchNormConfig::new(2), &PrecisionPlan::full_precision(Device::Cpu))?;
        let x = input()?;
        norm.forward_t(&x, true)?;

        // channel 0 holds 0..8 and 16..24, mean 11.5
        let running_mean = norm.running_mean().to_vec1::<f32>()?;
        assert!((running_mean[0] - 1.15).abs() < 1e-5);
        assert!((running_mean[1] - 1.95).abs() < 1e-5);

        let before = norm.running_mean().to_vec1::<f32>()?;
        norm.forward_t(&x, false)?;
        assert_eq!(norm.running_mean().to_vec1::<f32>()?, before);
        Ok(())
    }

    #[test]
    fn half_activations_round_trip_through_f32_stats() -> Result<()> {
        let plan = PrecisionPlan::half(Device::Cpu);
        let norm = BatchNorm2d::new(BatchNormConfig::new(2), &plan)?;
        let x = input()?.to_dtype(DType::F16)?;
        let out = norm.forward_t(&x, true)?;
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(norm.running_mean().dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn parameters_exclude_running_stats() {
        let norm = BatchNorm2d::new(BatchNormConfig::new(3), &PrecisionPlan::full_precision(Device::Cpu))
            .unwrap();
        let mut params = Vec::new();
        norm.push_parameters("bn", &mut params);
        let names: Vec<_> = params.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["bn.weight", "bn.bias"]);

        let mut buffers = Vec::new();
        norm.push_buffers("bn", &mut buffers);
        assert_eq!(buffers.len(), 2);
    }
}
