//! Grouped 2D convolution layer.

use rand::Rng;

use needle_tensor::prelude::*;

use crate::init;
use crate::module::{Module, Parameter};

/// Stride, group count and bias switch for [`ConvGp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvOptions {
    pub stride: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for ConvOptions {
    fn default() -> Self {
        ConvOptions {
            stride: 1,
            groups: 1,
            bias: true,
        }
    }
}

impl ConvOptions {
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Grouped convolution over NCHW input with "same" padding `(k - 1) / 2`.
///
/// Weight layout is `(out_channels, in_channels / groups, k, k)`.
#[derive(Debug, Clone)]
pub struct ConvGp {
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub groups: usize,
}

impl ConvGp {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        options: ConvOptions,
        rng: &mut R,
        config: &Config,
    ) -> Result<Self> {
        let ConvOptions {
            stride,
            groups,
            bias,
        } = options;
        if kernel_size == 0 || stride == 0 || groups == 0 {
            return Err(TensorError::invalid(format!(
                "conv needs kernel_size, stride and groups >= 1 (got {kernel_size}, {stride}, {groups})"
            )));
        }
        if in_channels % groups != 0 || out_channels % groups != 0 {
            return Err(TensorError::invalid(format!(
                "{in_channels} -> {out_channels} channels do not split into {groups} groups"
            )));
        }

        let fan_in = in_channels / groups * kernel_size * kernel_size;
        let weight = init::kaiming_uniform(
            [out_channels, in_channels / groups, kernel_size, kernel_size],
            fan_in,
            rng,
            config,
        )?;
        let bias = if bias {
            let bound = 1.0 / (fan_in as f64).sqrt();
            let b = init::uniform([out_channels], -bound, bound, rng, config)?;
            Some(Parameter::new("conv.bias", b, config.mode))
        } else {
            None
        };

        Ok(ConvGp {
            weight: Parameter::new("conv.weight", weight, config.mode),
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            groups,
        })
    }

    pub fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }
}

impl Module for ConvGp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.conv2d(self.weight.tensor(), self.stride, self.padding(), self.groups)?;
        match &self.bias {
            Some(bias) => y.add(&bias.tensor().reshape([1, self.out_channels, 1, 1])?),
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
