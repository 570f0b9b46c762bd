//! Precision and device planning for parameter groups.
//!
//! The plan is decided once when a model is built. Convolution and linear
//! weights follow the storage dtype (typically `f16` on accelerators) while
//! batch-norm parameters and statistics always stay in `f32`. Every layer asks
//! the plan for its [`ParameterGroup`] instead of being converted after
//! construction.

use candle_core::{DType, Device, Result, Tensor};

use crate::init::LayerKind;

/// Where and in which dtype a group of parameters lives.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub dtype: DType,
    pub device: Device,
}

/// Per-model precision decisions threaded through layer construction.
#[derive(Debug, Clone)]
pub struct PrecisionPlan {
    storage: DType,
    normalization: DType,
    device: Device,
}

impl PrecisionPlan {
    /// Builds a plan storing weights and activations in `storage`.
    pub fn new(storage: DType, device: Device) -> Self {
        Self {
            storage,
            normalization: DType::F32,
            device,
        }
    }

    /// Everything in `f32`.
    pub fn full_precision(device: Device) -> Self {
        Self::new(DType::F32, device)
    }

    /// Half precision weights with `f32` batch-norm.
    pub fn half(device: Device) -> Self {
        Self::new(DType::F16, device)
    }

    /// Dtype used for activations flowing between layers.
    pub fn activation_dtype(&self) -> DType {
        self.storage
    }

    /// Dtype used for normalisation statistics and affine parameters.
    pub fn normalization_dtype(&self) -> DType {
        self.normalization
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Indicates whether the plan mixes dtypes across parameter groups.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.normalization
    }

    /// Resolves the parameter group for a layer kind.
    pub fn group(&self, kind: &LayerKind) -> ParameterGroup {
        let dtype = match kind {
            LayerKind::BatchNorm { .. } => self.normalization,
            LayerKind::Conv2d { .. } | LayerKind::Linear { .. } => self.storage,
        };
        ParameterGroup {
            dtype,
            device: self.device.clone(),
        }
    }
}

/// Casts `tensor` to `dtype`, returning a cheap clone when it already matches.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
