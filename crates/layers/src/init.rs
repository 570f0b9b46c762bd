//! Closed description of layer kinds and their initialisation rules.
//!
//! Each layer declares its [`LayerKind`] up front and receives the matching
//! [`InitRule`]. Convolution and linear weights use Kaiming-uniform with fan-in
//! and the linear gain, batch-norm scales start at one and shifts at zero.

use candle_core::{Result, Tensor};

use crate::dtypes::{cast_tensor, ParameterGroup};

/// Layer kinds the model is assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    },
    BatchNorm {
        channels: usize,
    },
    Linear {
        in_features: usize,
        out_features: usize,
    },
}

/// Initialisation applied to a single parameter tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitRule {
    /// Uniform in `[-bound, bound]` with `bound = gain * sqrt(3 / fan_in)`.
    KaimingUniform { gain: f64 },
    Constant(f64),
}

impl LayerKind {
    /// Shape of the main weight tensor.
    pub fn weight_shape(&self) -> Vec<usize> {
        match *self {
            LayerKind::Conv2d {
                in_channels,
                out_channels,
                kernel,
            } => vec![out_channels, in_channels, kernel, kernel],
            LayerKind::BatchNorm { channels } => vec![channels],
            LayerKind::Linear {
                in_features,
                out_features,
            } => vec![out_features, in_features],
        }
    }

    pub fn fan_in(&self) -> usize {
        match *self {
            LayerKind::Conv2d {
                in_channels,
                kernel,
                ..
            } => in_channels * kernel * kernel,
            LayerKind::BatchNorm { .. } => 1,
            LayerKind::Linear { in_features, .. } => in_features,
        }
    }

    pub fn weight_init(&self) -> InitRule {
        match self {
            LayerKind::Conv2d { .. } | LayerKind::Linear { .. } => {
                InitRule::KaimingUniform { gain: 1.0 }
            }
            LayerKind::BatchNorm { .. } => InitRule::Constant(1.0),
        }
    }

    /// Rule for the additive term, if the layer carries one by default.
    pub fn bias_init(&self) -> Option<InitRule> {
        match self {
            LayerKind::BatchNorm { .. } => Some(InitRule::Constant(0.0)),
            LayerKind::Conv2d { .. } | LayerKind::Linear { .. } => None,
        }
    }

    /// Samples the weight tensor in the group's dtype and device.
    pub fn sample_weight(&self, group: &ParameterGroup) -> Result<Tensor> {
        self.weight_init()
            .sample(&self.weight_shape(), self.fan_in(), group)
    }
}

impl InitRule {
    /// Half-width of the uniform range for `fan_in` inputs.
    pub fn bound(&self, fan_in: usize) -> Option<f64> {
        match self {
            InitRule::KaimingUniform { gain } => Some(gain * (3.0 / fan_in.max(1) as f64).sqrt()),
            InitRule::Constant(_) => None,
        }
    }

    pub fn sample(&self, shape: &[usize], fan_in: usize, group: &ParameterGroup) -> Result<Tensor> {
        let values = match self {
            InitRule::KaimingUniform { .. } => {
                let bound = self.bound(fan_in).unwrap_or_default() as f32;
                Tensor::rand(-bound, bound, shape, &group.device)?
            }
            InitRule::Constant(value) => {
                Tensor::full(*value as f32, shape, &group.device)?
            }
        };
        cast_tensor(&values, group.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn group(dtype: DType) -> ParameterGroup {
        ParameterGroup {
            dtype,
            device: Device::Cpu,
        }
    }

    #[test]
    fn conv_weights_respect_fan_in_bound() -> Result<()> {
        let kind = LayerKind::Conv2d {
            in_channels: 16,
            out_channels: 32,
            kernel: 3,
        };
        assert_eq!(kind.fan_in(), 144);
        let weight = kind.sample_weight(&group(DType::F32))?;
        assert_eq!(weight.dims(), &[32, 16, 3, 3]);

        let bound = kind.weight_init().bound(kind.fan_in()).unwrap() as f32;
        assert!((bound - (3.0f32 / 144.0).sqrt()).abs() < 1e-6);
        let max = weight.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max <= bound);
        Ok(())
    }

    #[test]
    fn batch_norm_starts_as_identity() -> Result<()> {
        let kind = LayerKind::BatchNorm { channels: 4 };
        let weight = kind.sample_weight(&group(DType::F32))?;
        assert_eq!(weight.to_vec1::<f32>()?, vec![1.0; 4]);
        let bias = kind
            .bias_init()
            .unwrap()
            .sample(&kind.weight_shape(), kind.fan_in(), &group(DType::F32))?;
        assert_eq!(bias.to_vec1::<f32>()?, vec![0.0; 4]);
        Ok(())
    }

    #[test]
    fn linear_has_no_bias_and_follows_group_dtype() -> Result<()> {
        let kind = LayerKind::Linear {
            in_features: 256,
            out_features: 10,
        };
        assert!(kind.bias_init().is_none());
        let weight = kind.sample_weight(&group(DType::F16))?;
        assert_eq!(weight.dtype(), DType::F16);
        assert_eq!(weight.dims(), &[10, 256]);
        Ok(())
    }
}
