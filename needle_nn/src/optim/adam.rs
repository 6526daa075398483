//! Adam optimizer.

use std::collections::HashMap;

use log::debug;

use needle_tensor::Result;

use super::{apply_update, Optimizer};
use crate::module::{ParamId, Parameter};

/// First and second moment estimates for one parameter.
#[derive(Debug, Clone)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
}

/// Adam optimizer (Adaptive Moment Estimation) with L2 weight decay.
#[derive(Debug, Clone)]
pub struct Adam {
    /// Learning rate.
    pub lr: f64,
    /// Exponential decay rate for first moment.
    pub beta1: f64,
    /// Exponential decay rate for second moment.
    pub beta2: f64,
    /// Small constant for numerical stability.
    pub eps: f64,
    pub weight_decay: f64,
    moments: HashMap<ParamId, Moments>,
    /// Step counter, advanced once per `step` call.
    t: i32,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    pub fn new(lr: f64) -> Self {
        Self::with_params(lr, 0.9, 0.999, 1e-8)
    }

    /// Create an Adam optimizer with custom hyperparameters.
    pub fn with_params(lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay: 0.0,
            moments: HashMap::new(),
            t: 0,
        }
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        self.t += 1;
        let (lr, beta1, beta2, eps, wd) = (
            self.lr,
            self.beta1,
            self.beta2,
            self.eps,
            self.weight_decay,
        );

        // Bias correction factors
        let bias_correction1 = 1.0 - beta1.powi(self.t);
        let bias_correction2 = 1.0 - beta2.powi(self.t);

        for param in params.iter_mut() {
            let n = param.numel();
            let state = self.moments.entry(param.id()).or_insert_with(|| Moments {
                m: vec![0.0; n],
                v: vec![0.0; n],
            });

            apply_update(param, |values, grad| {
                let mut next = values.to_vec();
                for i in 0..n {
                    let g = grad[i] + wd * values[i];
                    state.m[i] = beta1 * state.m[i] + (1.0 - beta1) * g;
                    state.v[i] = beta2 * state.v[i] + (1.0 - beta2) * g * g;

                    let m_hat = state.m[i] / bias_correction1;
                    let v_hat = state.v[i] / bias_correction2;
                    next[i] -= lr * m_hat / (v_hat.sqrt() + eps);
                }
                next
            })?;
        }

        debug!("adam step {} over {} parameters", self.t, params.len());
        Ok(())
    }

    /// Reset optimizer state.
    fn reset(&mut self) {
        self.moments.clear();
        self.t = 0;
    }
}
