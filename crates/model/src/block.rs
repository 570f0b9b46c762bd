use candle_core::{Result, Tensor, Var};
use layers::{BatchNormConfig, Conv2dConfig, ConvBn, NamedParameters, PrecisionPlan};

use crate::config::ModelConfig;

/// Two conv-bn layers that squeeze to half the width and back, added to the input.
#[derive(Debug, Clone)]
pub struct Residual {
    channels: usize,
    squeeze: ConvBn,
    expand: ConvBn,
}

impl Residual {
    pub fn new(channels: usize, config: &ModelConfig, plan: &PrecisionPlan) -> Result<Self> {
        let hidden = channels / 2;
        Ok(Self {
            channels,
            squeeze: conv_bn(channels, hidden, config, plan)?,
            expand: conv_bn(hidden, channels, config, plan)?,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn forward_t(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.squeeze.forward_t(input, train)?;
        let hidden = self.expand.forward_t(&hidden, train)?;
        input.add(&hidden)
    }
}

impl NamedParameters for Residual {
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.squeeze.push_parameters(&format!("{prefix}.squeeze"), out);
        self.expand.push_parameters(&format!("{prefix}.expand"), out);
    }

    fn push_buffers(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        self.squeeze.push_buffers(&format!("{prefix}.squeeze"), out);
        self.expand.push_buffers(&format!("{prefix}.expand"), out);
    }
}

/// 3×3 same-padded conv-bn-relu with the model's batch-norm numerics.
pub(crate) fn conv_bn(
    in_channels: usize,
    out_channels: usize,
    config: &ModelConfig,
    plan: &PrecisionPlan,
) -> Result<ConvBn> {
    conv_bn_with(Conv2dConfig::same(in_channels, out_channels), config, plan)
}

pub(crate) fn conv_bn_with(
    conv: Conv2dConfig,
    config: &ModelConfig,
    plan: &PrecisionPlan,
) -> Result<ConvBn> {
    let norm = BatchNormConfig {
        channels: conv.out_channels,
        epsilon: config.bn_epsilon,
        momentum: config.bn_momentum,
    };
    ConvBn::new(conv, norm, plan)
}
