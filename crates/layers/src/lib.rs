//! Convolutional building blocks for the CIFAR classifier.
//!
//! Layers hold their parameters as [`candle_core::Var`]s so the optimizer can
//! update them in place. Construction is driven by an explicit
//! [`dtypes::PrecisionPlan`] and a closed set of [`init::LayerKind`]s instead of
//! walking a module tree after the fact.

pub mod checks;
pub mod conv;
pub mod dtypes;
pub mod init;
pub mod linear;
pub mod norm;

pub use conv::{Conv2d, Conv2dConfig, ConvBn};
pub use dtypes::{ParameterGroup, PrecisionPlan};
pub use init::{InitRule, LayerKind};
pub use linear::{Linear, LinearConfig};
pub use norm::{BatchNorm2d, BatchNormConfig};

use candle_core::Var;

/// Collects named parameters from a layer, prefixing each name with `prefix`.
pub trait NamedParameters {
    /// Appends trainable parameters to `out`.
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>);

    /// Appends non-trainable state (running statistics) to `out`.
    fn push_buffers(&self, _prefix: &str, _out: &mut Vec<(String, Var)>) {}
}

pub(crate) fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
