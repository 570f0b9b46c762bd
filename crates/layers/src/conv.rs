//! Convolutions and the conv → batch-norm → ReLU block.
//!
//! Convolutions carry no bias (the following batch norm absorbs it) and keep
//! their weights in the plan's activation dtype.

use candle_core::{Result, Tensor, Var};

use crate::{
    checks,
    dtypes::{cast_tensor, PrecisionPlan},
    init::LayerKind,
    join_name,
    norm::{BatchNorm2d, BatchNormConfig},
    NamedParameters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2dConfig {
    /// 3×3, stride 1, same padding.
    pub fn same(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel: 3,
            stride: 1,
            padding: 1,
        }
    }

    pub fn with_kernel(mut self, kernel: usize) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn kind(&self) -> LayerKind {
        LayerKind::Conv2d {
            in_channels: self.in_channels,
            out_channels: self.out_channels,
            kernel: self.kernel,
        }
    }

    /// Spatial size after the convolution for a square `input` side.
    pub fn output_size(&self, input: usize) -> usize {
        (input + 2 * self.padding).saturating_sub(self.kernel) / self.stride.max(1) + 1
    }
}

#[derive(Debug, Clone)]
pub struct Conv2d {
    config: Conv2dConfig,
    weight: Var,
}

impl Conv2d {
    pub fn new(config: Conv2dConfig, plan: &PrecisionPlan) -> Result<Self> {
        if config.in_channels == 0 || config.out_channels == 0 || config.kernel == 0 {
            candle_core::bail!("conv2d requires non-zero channels and kernel, got {:?}", config);
        }
        if config.stride == 0 {
            candle_core::bail!("conv2d stride must be greater than zero");
        }
        let kind = config.kind();
        let weight = kind.sample_weight(&plan.group(&kind))?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
        })
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_nchw("conv2d", input, self.config.in_channels)?;
        let x = cast_tensor(input, self.weight.dtype())?;
        x.conv2d(
            self.weight.as_tensor(),
            self.config.padding,
            self.config.stride,
            1,
            1,
        )
    }
}

impl NamedParameters for Conv2d {
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
    }
}

/// Convolution followed by batch norm and ReLU.
#[derive(Debug, Clone)]
pub struct ConvBn {
    conv: Conv2d,
    norm: BatchNorm2d,
}

impl ConvBn {
    pub fn new(conv: Conv2dConfig, norm: BatchNormConfig, plan: &PrecisionPlan) -> Result<Self> {
        if conv.out_channels != norm.channels {
            candle_core::bail!(
                "conv_bn channel mismatch: conv produces {} but norm expects {}",
                conv.out_channels,
                norm.channels
            );
        }
        Ok(Self {
            conv: Conv2d::new(conv, plan)?,
            norm: BatchNorm2d::new(norm, plan)?,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.conv.config().out_channels
    }

    pub fn norm(&self) -> &BatchNorm2d {
        &self.norm
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.conv.forward(input)?;
        self.norm.forward_t(&hidden, train)?.relu()
    }
}

impl NamedParameters for ConvBn {
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.conv.push_parameters(&join_name(prefix, "conv"), out);
        self.norm.push_parameters(&join_name(prefix, "bn"), out);
    }

    fn push_buffers(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.norm.push_buffers(&join_name(prefix, "bn"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn strided_conv_halves_spatial_size() -> Result<()> {
        let plan = PrecisionPlan::full_precision(Device::Cpu);
        let config = Conv2dConfig::same(3, 8).with_kernel(5).with_stride(2);
        let conv = Conv2d::new(config, &plan)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu)?;
        let y = conv.forward(&x)?;
        assert_eq!(config.output_size(32), 15);
        assert_eq!(y.dims(), &[2, 8, 15, 15]);
        Ok(())
    }

    #[test]
    fn conv_bn_output_is_non_negative() -> Result<()> {
        let plan = PrecisionPlan::full_precision(Device::Cpu);
        let block = ConvBn::new(Conv2dConfig::same(3, 4), BatchNormConfig::new(4), &plan)?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu)?;
        let y = block.forward_t(&x, true)?;
        assert_eq!(y.dims(), &[2, 4, 8, 8]);
        let min = y.flatten_all()?.min(0)?.to_scalar::<f32>()?;
        assert!(min >= 0.0);
        Ok(())
    }

    #[test]
    fn conv_bn_rejects_channel_mismatch() {
        let plan = PrecisionPlan::full_precision(Device::Cpu);
        let result = ConvBn::new(Conv2dConfig::same(3, 4), BatchNormConfig::new(8), &plan);
        assert!(result.is_err());
    }

    #[test]
    fn conv_casts_input_to_weight_dtype() -> Result<()> {
        let plan = PrecisionPlan::full_precision(Device::Cpu);
        let conv = Conv2d::new(Conv2dConfig::same(2, 2), &plan)?;
        let x = Tensor::ones((1, 2, 4, 4), DType::F64, &Device::Cpu)?;
        let y = conv.forward(&x)?;
        assert_eq!(y.dtype(), DType::F32);
        Ok(())
    }
}
