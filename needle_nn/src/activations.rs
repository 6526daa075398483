//! Activation functions, as plain functions and as parameter-free modules.

use std::f64::consts::PI;

use needle_tensor::prelude::*;

use crate::module::Module;

fn last_axis(x: &Tensor) -> Result<usize> {
    match x.ndim() {
        0 => Err(TensorError::InvalidAxis { axis: 0, ndim: 0 }),
        n => Ok(n - 1),
    }
}

/// ReLU activation: max(0, x)
pub fn relu(x: &Tensor) -> Result<Tensor> {
    x.relu()
}

/// Sigmoid activation: 1 / (1 + exp(-x))
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.sigmoid()
}

pub fn tanh(x: &Tensor) -> Result<Tensor> {
    x.tanh()
}

/// GELU, tanh approximation:
/// 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    let inner = x
        .add(&x.powf(3.0)?.mul_scalar(0.044715)?)?
        .mul_scalar((2.0 / PI).sqrt())?;
    x.mul(&inner.tanh()?.add_scalar(1.0)?)?.mul_scalar(0.5)
}

/// Softmax along the last axis, stabilized by subtracting the max.
pub fn softmax(x: &Tensor) -> Result<Tensor> {
    x.softmax(last_axis(x)?)
}

/// Log-softmax along the last axis.
pub fn log_softmax(x: &Tensor) -> Result<Tensor> {
    x.log_softmax(last_axis(x)?)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Module for Relu {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        relu(x)
    }
}

impl Module for Tanh {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        tanh(x)
    }
}

impl Module for Sigmoid {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        sigmoid(x)
    }
}

impl Module for Gelu {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        gelu(x)
    }
}
