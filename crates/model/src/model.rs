use candle_core::{DType, Result, Tensor, Var};
use layers::{checks, Conv2dConfig, ConvBn, Linear, LinearConfig, NamedParameters};

use crate::{
    block::{conv_bn, conv_bn_with, Residual},
    classifier::Classifier,
    config::ModelConfig,
};

/// Residual convolutional classifier for 32×32 images.
///
/// Layout: conv-bn(3×3) → conv-bn(5×5, stride 2) → residual → conv-bn →
/// max-pool(2) → residual → conv-bn → global max-pool → linear → scale.
pub struct ConvNet {
    config: ModelConfig,
    stem: ConvBn,
    downsample: ConvBn,
    stage1: Residual,
    expand: ConvBn,
    stage2: Residual,
    tail: ConvBn,
    head: Linear,
}

impl ConvNet {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let plan = config.precision_plan();

        let stem = conv_bn(config.in_channels, config.stem_channels, &config, &plan)?;
        let downsample = conv_bn_with(
            Conv2dConfig::same(config.stem_channels, config.stage1_channels)
                .with_kernel(5)
                .with_stride(2),
            &config,
            &plan,
        )?;
        let stage1 = Residual::new(config.stage1_channels, &config, &plan)?;
        let expand = conv_bn(config.stage1_channels, config.stage2_channels, &config, &plan)?;
        let stage2 = Residual::new(config.stage2_channels, &config, &plan)?;
        let tail = conv_bn(config.stage2_channels, config.head_channels, &config, &plan)?;
        let head = Linear::new(
            LinearConfig::new(config.head_channels, config.num_classes).without_bias(),
            &plan,
        )?;

        let model = Self {
            config,
            stem,
            downsample,
            stage1,
            expand,
            stage2,
            tail,
            head,
        };
        log::debug!(
            "built conv net: {} parameter tensors, dtype {:?}",
            model.trainable_parameters().len(),
            model.config.dtype
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Batch-norm running statistics, which the optimizer must not touch.
    pub fn buffers(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.stem.push_buffers("stem", &mut out);
        self.downsample.push_buffers("downsample", &mut out);
        self.stage1.push_buffers("stage1", &mut out);
        self.expand.push_buffers("expand", &mut out);
        self.stage2.push_buffers("stage2", &mut out);
        self.tail.push_buffers("tail", &mut out);
        out
    }
}

impl Classifier for ConvNet {
    fn forward_t(&self, inputs: &Tensor, train: bool) -> Result<Tensor> {
        checks::expect_nchw("conv_net", inputs, self.config.in_channels)?;
        let hidden = self.stem.forward_t(inputs, train)?;
        let hidden = self.downsample.forward_t(&hidden, train)?;
        let hidden = self.stage1.forward_t(&hidden, train)?;
        let hidden = self.expand.forward_t(&hidden, train)?;
        let hidden = hidden.max_pool2d(2)?;
        let hidden = self.stage2.forward_t(&hidden, train)?;
        let hidden = self.tail.forward_t(&hidden, train)?;
        // global max pool: (B, C, H, W) -> (B, C)
        let pooled = hidden.flatten_from(2)?.max(2)?;
        let logits = self.head.forward(&pooled)?;
        logits.affine(self.config.logit_scale, 0.0)
    }

    fn trainable_parameters(&self) -> Vec<(String, Var)> {
        let mut out = Vec::new();
        self.stem.push_parameters("stem", &mut out);
        self.downsample.push_parameters("downsample", &mut out);
        self.stage1.push_parameters("stage1", &mut out);
        self.expand.push_parameters("expand", &mut out);
        self.stage2.push_parameters("stage2", &mut out);
        self.tail.push_parameters("tail", &mut out);
        self.head.push_parameters("head", &mut out);
        out
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn input_dtype(&self) -> DType {
        self.config.dtype
    }
}
