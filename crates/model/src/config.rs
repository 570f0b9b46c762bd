use candle_core::{DType, Device, Error, Result};
use layers::PrecisionPlan;

/// Widths and numerics of the residual CIFAR network.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    /// Output width of the first 3×3 convolution.
    pub stem_channels: usize,
    /// Width after the strided 5×5 convolution and the first residual block.
    pub stage1_channels: usize,
    /// Width after the second expansion and the second residual block.
    pub stage2_channels: usize,
    /// Width of the final convolution feeding the classifier head.
    pub head_channels: usize,
    /// Constant multiplier applied to the logits.
    pub logit_scale: f64,
    pub bn_epsilon: f64,
    pub bn_momentum: f64,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    /// The reference 10-class network.
    pub fn cifar10(dtype: DType, device: Device) -> Self {
        Self {
            in_channels: 3,
            num_classes: 10,
            stem_channels: 64,
            stage1_channels: 128,
            stage2_channels: 256,
            head_channels: 256,
            logit_scale: 0.125,
            bn_epsilon: 1e-4,
            bn_momentum: 0.1,
            dtype,
            device,
        }
    }

    /// A narrow variant used by tests and smoke runs.
    pub fn tiny(num_classes: usize, device: Device) -> Self {
        Self {
            stem_channels: 4,
            stage1_channels: 8,
            stage2_channels: 8,
            head_channels: 8,
            num_classes,
            ..Self::cifar10(DType::F32, device)
        }
    }

    pub fn precision_plan(&self) -> PrecisionPlan {
        PrecisionPlan::new(self.dtype, self.device.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let widths = [
            ("in_channels", self.in_channels),
            ("num_classes", self.num_classes),
            ("stem_channels", self.stem_channels),
            ("stage1_channels", self.stage1_channels),
            ("stage2_channels", self.stage2_channels),
            ("head_channels", self.head_channels),
        ];
        for (name, value) in widths {
            if value == 0 {
                return Err(Error::Msg(format!("{name} must be greater than zero")));
            }
        }
        for (name, value) in [
            ("stage1_channels", self.stage1_channels),
            ("stage2_channels", self.stage2_channels),
        ] {
            if value % 2 != 0 {
                return Err(Error::Msg(format!(
                    "{name} ({value}) must be even; residual blocks halve it internally"
                )));
            }
        }
        if !self.logit_scale.is_finite() || self.logit_scale <= 0.0 {
            return Err(Error::Msg("logit_scale must be positive".into()));
        }
        if self.bn_epsilon <= 0.0 {
            return Err(Error::Msg("bn_epsilon must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(Error::Msg("bn_momentum must be in [0, 1]".into()));
        }
        if !matches!(self.dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(Error::Msg(format!(
                "unsupported parameter dtype {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}
