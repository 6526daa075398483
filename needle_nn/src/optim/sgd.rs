//! Stochastic Gradient Descent optimizer.

use std::collections::HashMap;

use log::debug;

use needle_tensor::Result;

use super::{apply_update, Optimizer};
use crate::module::{ParamId, Parameter};

/// SGD optimizer with optional momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct SGD {
    /// Learning rate.
    pub lr: f64,
    /// Momentum coefficient.
    pub momentum: f64,
    pub weight_decay: f64,
    /// Velocity buffers for momentum, keyed by parameter slot.
    velocities: HashMap<ParamId, Vec<f64>>,
}

impl SGD {
    /// Create a new SGD optimizer.
    pub fn new(lr: f64) -> Self {
        SGD {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            velocities: HashMap::new(),
        }
    }

    /// Create an SGD optimizer with momentum.
    pub fn with_momentum(lr: f64, momentum: f64) -> Self {
        SGD {
            momentum,
            ..Self::new(lr)
        }
    }

    pub fn weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<()> {
        let (lr, momentum, wd) = (self.lr, self.momentum, self.weight_decay);
        let mut updated = 0;

        for param in params.iter_mut() {
            let velocity = if momentum > 0.0 {
                Some(
                    self.velocities
                        .entry(param.id())
                        .or_insert_with(|| vec![0.0; param.numel()]),
                )
            } else {
                None
            };

            let stepped = apply_update(param, |values, grad| {
                let mut next = values.to_vec();
                match velocity {
                    // v = momentum * v + g; param = param - lr * v
                    Some(velocity) => {
                        for i in 0..next.len() {
                            let g = grad[i] + wd * values[i];
                            velocity[i] = momentum * velocity[i] + g;
                            next[i] -= lr * velocity[i];
                        }
                    }
                    // param = param - lr * g
                    None => {
                        for i in 0..next.len() {
                            next[i] -= lr * (grad[i] + wd * values[i]);
                        }
                    }
                }
                next
            })?;
            updated += usize::from(stepped);
        }

        debug!("sgd step: {updated}/{} parameters updated", params.len());
        Ok(())
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }
}
