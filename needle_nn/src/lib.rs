//! # needle_nn - Neural Network Layers for needle_tensor
//!
//! This crate provides neural network building blocks on top of the
//! needle_tensor autodiff engine:
//!
//! - **Modules**: `Parameter`, the `Module` trait, `Sequential`
//! - **Layers**: Linear (fully connected), ConvGp (grouped convolution)
//! - **Activations**: ReLU, Sigmoid, Tanh, GELU, Softmax, Log-Softmax
//! - **Losses**: MSE, Binary Cross-Entropy, Soft Cross-Entropy, Cross-Entropy
//! - **Optimizers**: SGD (momentum, weight decay), Adam
//!
//! ## Example: Training a Simple MLP
//!
//! ```ignore
//! use needle_nn::{mse_loss, Linear, Module, Optimizer, Relu, Sequential, SGD};
//! use needle_tensor::prelude::*;
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! let config = Config::new(needle_backend_cpu::cpu());
//! let mut rng = StdRng::seed_from_u64(0);
//!
//! let mut model = Sequential::new()
//!     .add(Linear::new(2, 4, true, &mut rng, &config)?)
//!     .add(Relu)
//!     .add(Linear::new(4, 1, true, &mut rng, &config)?);
//! let mut opt = SGD::new(0.01);
//!
//! for _ in 0..100 {
//!     let x = Tensor::constant(&[1.0, 2.0], [1, 2], &config)?;
//!     let target = Tensor::constant(&[5.0], [1, 1], &config)?;
//!
//!     let loss = mse_loss(&model.forward(&x)?, &target)?;
//!     loss.backward()?;
//!     opt.step(&mut model.parameters_mut())?;
//! }
//! ```

pub mod activations;
pub mod init;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

// Re-exports for convenience
pub use activations::{gelu, log_softmax, relu, sigmoid, softmax, tanh, Gelu, Relu, Sigmoid, Tanh};
pub use layers::{ConvGp, ConvOptions, Linear};
pub use loss::{binary_cross_entropy_with_logits, cross_entropy, mse_loss, one_hot, soft_cross_entropy};
pub use module::{Module, ParamId, Parameter, Sequential};
pub use optim::{Adam, Optimizer, SGD};
