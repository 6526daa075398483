//! Finite difference utilities for gradient verification.
//!
//! Provides numerical gradients of tensor functions for checking the
//! analytic gradient rules. Use float64 tensors when tight tolerances matter.

use crate::error::{Result, TensorError};
use crate::node::Tensor;
use crate::storage::NDArray;

/// Compute gradients of `sum(f(inputs))` using central finite differences.
///
/// Returns one row-major gradient vector per input.
pub fn finite_diff_grad<F>(f: F, inputs: &[Tensor], eps: f64) -> Result<Vec<Vec<f64>>>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let points = inputs
        .iter()
        .map(Tensor::to_vec)
        .collect::<Result<Vec<_>>>()?;
    let mut args = inputs
        .iter()
        .map(Tensor::detach)
        .collect::<Result<Vec<_>>>()?;

    let mut grads = Vec::with_capacity(inputs.len());
    for (i, input) in inputs.iter().enumerate() {
        let mut perturbed = points[i].clone();
        let mut input_grads = Vec::with_capacity(perturbed.len());

        for j in 0..perturbed.len() {
            // Central difference: (f(x + eps) - f(x - eps)) / (2 * eps)
            perturbed[j] = points[i][j] + eps;
            args[i] = leaf_like(input, &perturbed)?;
            let f_plus = f(&args)?.sum(None, false)?.item()?;

            perturbed[j] = points[i][j] - eps;
            args[i] = leaf_like(input, &perturbed)?;
            let f_minus = f(&args)?.sum(None, false)?.item()?;

            perturbed[j] = points[i][j]; // restore
            input_grads.push((f_plus - f_minus) / (2.0 * eps));
        }

        args[i] = leaf_like(input, &points[i])?;
        grads.push(input_grads);
    }

    Ok(grads)
}

fn leaf_like(template: &Tensor, values: &[f64]) -> Result<Tensor> {
    let value = NDArray::from_f64(
        values,
        template.shape().clone(),
        template.dtype(),
        template.device(),
    )?;
    Ok(Tensor::from_ndarray(value, false, template.mode()))
}

/// Compute the maximum absolute difference between two gradient vectors.
pub fn max_grad_error(grad1: &[f64], grad2: &[f64]) -> f64 {
    debug_assert_eq!(grad1.len(), grad2.len());
    grad1
        .iter()
        .zip(grad2.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}

/// Maximum of `|a - b| / max(1, |a|, |b|)`: relative for large entries,
/// absolute near zero.
pub fn max_relative_error(grad1: &[f64], grad2: &[f64]) -> f64 {
    debug_assert_eq!(grad1.len(), grad2.len());
    grad1
        .iter()
        .zip(grad2.iter())
        .map(|(a, b)| (a - b).abs() / a.abs().max(b.abs()).max(1.0))
        .fold(0.0, f64::max)
}

/// Analytic vs numerical gradients of `sum(f(inputs))`.
#[derive(Debug, Clone)]
pub struct GradCheck {
    pub analytic: Vec<Vec<f64>>,
    pub numeric: Vec<Vec<f64>>,
    pub max_abs_error: f64,
    pub max_rel_error: f64,
}

impl GradCheck {
    pub fn passes(&self, tol: f64) -> bool {
        self.max_rel_error <= tol
    }
}

/// Differentiate `sum(f(inputs))` both ways and compare.
///
/// `inputs` are re-wrapped as fresh variables, so callers may pass constants.
pub fn check_gradients<F>(f: F, inputs: &[Tensor], eps: f64) -> Result<GradCheck>
where
    F: Fn(&[Tensor]) -> Result<Tensor>,
{
    let vars = inputs
        .iter()
        .map(|t| Ok(Tensor::from_ndarray(t.realize()?.clone(), true, t.mode())))
        .collect::<Result<Vec<_>>>()?;
    let loss = f(&vars)?.sum(None, false)?;
    let grads = loss.backward()?;

    let analytic = vars
        .iter()
        .map(|v| match grads.wrt(v) {
            Some(g) => g.to_vec_f64(),
            None => Ok(vec![0.0; v.numel()]),
        })
        .collect::<Result<Vec<_>>>()?;
    let numeric = finite_diff_grad(&f, inputs, eps)?;

    if analytic.iter().map(Vec::len).ne(numeric.iter().map(Vec::len)) {
        return Err(TensorError::invalid("gradient lengths differ"));
    }
    let flat_a: Vec<f64> = analytic.iter().flatten().copied().collect();
    let flat_n: Vec<f64> = numeric.iter().flatten().copied().collect();

    Ok(GradCheck {
        max_abs_error: max_grad_error(&flat_a, &flat_n),
        max_rel_error: max_relative_error(&flat_a, &flat_n),
        analytic,
        numeric,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_grad_error() {
        let g1 = vec![1.0, 2.0, 3.0];
        let g2 = vec![1.1, 2.0, 2.8];

        let err = max_grad_error(&g1, &g2);
        assert!((err - 0.2).abs() < 1e-10);
    }

    #[test]
    fn test_relative_error_scales() {
        // Large entries are compared relatively, small ones absolutely.
        assert!((max_relative_error(&[1000.0], &[1001.0]) - 1.0 / 1001.0).abs() < 1e-12);
        assert!((max_relative_error(&[1e-9], &[2e-9]) - 1e-9).abs() < 1e-15);
    }
}
