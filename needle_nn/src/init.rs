//! Seeded parameter initializers.
//!
//! Each takes the random source explicitly so runs are reproducible with a
//! seeded `StdRng`.

use rand::Rng;

use needle_tensor::prelude::*;

/// Uniform values in `[low, high)`.
pub fn uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    rng: &mut R,
    config: &Config,
) -> Result<NDArray> {
    let shape = shape.into();
    let values: Vec<f64> = (0..shape.numel())
        .map(|_| rng.gen_range(low..high))
        .collect();
    NDArray::from_f64(&values, shape, config.dtype, &config.device)
}

/// He/Kaiming uniform for ReLU networks: bound = sqrt(6 / fan_in).
pub fn kaiming_uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    fan_in: usize,
    rng: &mut R,
    config: &Config,
) -> Result<NDArray> {
    let bound = (6.0 / fan_in.max(1) as f64).sqrt();
    uniform(shape, -bound, bound, rng, config)
}

/// Glorot/Xavier uniform: bound = sqrt(6 / (fan_in + fan_out)).
pub fn xavier_uniform<R: Rng + ?Sized>(
    shape: impl Into<Shape>,
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
    config: &Config,
) -> Result<NDArray> {
    let bound = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
    uniform(shape, -bound, bound, rng, config)
}

pub fn zeros(shape: impl Into<Shape>, config: &Config) -> Result<NDArray> {
    NDArray::zeros(shape, config.dtype, &config.device)
}
