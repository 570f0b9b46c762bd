//! Dense projection used as the classifier head.
//!
//! Inputs are `(batch, in_features)`; outputs are `(batch, out_features)`.

use candle_core::{Result, Tensor, Var};

use crate::{
    checks,
    dtypes::{cast_tensor, PrecisionPlan},
    init::LayerKind,
    join_name, NamedParameters,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }

    pub fn kind(&self) -> LayerKind {
        LayerKind::Linear {
            in_features: self.input_dim,
            out_features: self.output_dim,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    pub fn new(config: LinearConfig, plan: &PrecisionPlan) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            candle_core::bail!("linear requires non-zero dimensions, got {:?}", config);
        }
        let kind = config.kind();
        let group = plan.group(&kind);
        let weight = Var::from_tensor(&kind.sample_weight(&group)?)?;
        let bias = if config.bias {
            let zeros = Tensor::zeros(config.output_dim, group.dtype, &group.device)?;
            Some(Var::from_tensor(&zeros)?)
        } else {
            None
        };
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_rank("linear", input, 2)?;
        let x = cast_tensor(input, self.weight.dtype())?;
        let out = x.matmul(&self.weight.as_tensor().t()?)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(bias.as_tensor()),
            None => Ok(out),
        }
    }
}

impl NamedParameters for Linear {
    fn push_parameters(&self, prefix: &str, out: &mut Vec<(String, Var)>) {
        out.push((join_name(prefix, "weight"), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push((join_name(prefix, "bias"), bias.clone()));
        }
    }
}
