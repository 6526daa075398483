//! Linear (fully connected) layer.

use rand::Rng;

use needle_tensor::prelude::*;

use crate::init;
use crate::module::{Module, Parameter};

/// A linear (fully connected) layer: y = x @ W^T + b
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix [out_features, in_features]
    pub weight: Parameter,
    /// Bias vector [out_features]
    pub bias: Option<Parameter>,
}

impl Linear {
    /// Create a new linear layer with random initialization.
    ///
    /// Weights use Kaiming uniform (fan_in = in_features); the bias is
    /// uniform in +-1/sqrt(in_features).
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
        config: &Config,
    ) -> Result<Self> {
        let weight = init::kaiming_uniform([out_features, in_features], in_features, rng, config)?;
        let weight = Parameter::new("linear.weight", weight, config.mode);

        let bias = if bias {
            let bound = 1.0 / (in_features.max(1) as f64).sqrt();
            let b = init::uniform([out_features], -bound, bound, rng, config)?;
            Some(Parameter::new("linear.bias", b, config.mode))
        } else {
            None
        };

        Ok(Linear { weight, bias })
    }

    /// Create a linear layer from existing weight and bias tensors.
    pub fn from_tensors(weight: &Tensor, bias: Option<&Tensor>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(TensorError::invalid(format!(
                "linear weight must be 2-D, got {}",
                weight.shape()
            )));
        }
        let bias = bias
            .map(|b| {
                if b.shape().dims() != [weight.shape().dim(0)] {
                    return Err(TensorError::shape_mismatch(
                        "linear bias",
                        weight.shape(),
                        b.shape(),
                    ));
                }
                Parameter::from_tensor("linear.bias", b)
            })
            .transpose()?;
        Ok(Linear {
            weight: Parameter::from_tensor("linear.weight", weight)?,
            bias,
        })
    }

    /// Get the number of input features.
    pub fn in_features(&self) -> usize {
        self.weight.shape().dim(1)
    }

    /// Get the number of output features.
    pub fn out_features(&self) -> usize {
        self.weight.shape().dim(0)
    }
}

impl Module for Linear {
    /// Input has shape [..., in_features] with at least two axes.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // [batch, in] @ [in, out] -> [batch, out]
        let y = x.matmul(&self.weight.tensor().t()?)?;
        match &self.bias {
            Some(bias) => y.add(bias.tensor()),
            None => Ok(y),
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}
