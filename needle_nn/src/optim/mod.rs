//! Optimizers for neural network training.
//!
//! An optimizer reads each parameter's gradient from the last backward pass
//! and replaces the parameter with a fresh leaf holding the updated values.
//! Parameters without a gradient are left untouched.

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::SGD;

use log::trace;

use needle_tensor::prelude::*;

use crate::module::Parameter;

pub trait Optimizer {
    /// Apply one update to every parameter that has a gradient.
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()>;

    /// Drop optimizer state (momentum buffers, moment estimates).
    fn reset(&mut self);
}

/// Host-side update: hands `(values, grad)` to `update` and stores the
/// returned values as the parameter's new leaf. Returns false when the
/// parameter has no gradient.
fn apply_update<F>(param: &mut Parameter, update: F) -> Result<bool>
where
    F: FnOnce(&[f64], &[f64]) -> Vec<f64>,
{
    let Some(grad) = param.grad() else {
        trace!("skipping parameter {} without gradient", param.name());
        return Ok(false);
    };
    let values = param.to_vec()?;
    let grad = grad.to_vec_f64()?;
    let updated = update(&values, &grad);

    let tensor = param.tensor();
    let next = NDArray::from_f64(&updated, tensor.shape().clone(), tensor.dtype(), tensor.device())?;
    param.replace(next)?;
    Ok(true)
}
