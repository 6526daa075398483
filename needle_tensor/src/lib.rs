//! # needle_tensor - Lazy Tensors with Reverse-Mode Autodiff
//!
//! This crate provides the core of the needle framework: strided N-dimensional
//! storage dispatched to pluggable backends, a lazily realized computation
//! graph, and a reverse-mode differentiator over it.
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Shape`] and [`Strides`] - Tensor shape and memory layout
//! - [`NDArray`] - Strided view over a device buffer
//! - [`Backend`] - Trait for compute backends implementing the primitives
//! - [`Device`], [`DeviceRegistry`], [`Config`] - Backend selection by tag
//! - [`Tensor`] - Reference-counted handle to a computation graph node
//! - [`Gradients`] - Result of backward pass
//!
//! ## Example
//!
//! ```ignore
//! use needle_tensor::prelude::*;
//!
//! let registry = needle_backend_cpu::default_registry();
//! let config = Config::new(registry.get("cpu")?);
//!
//! let x = Tensor::var(&[1.0, 2.0, 3.0], [3], &config)?;
//! let loss = x.mul(&x)?.sum(None, false)?;
//! loss.backward()?;
//!
//! assert_eq!(loss.item()?, 14.0);
//! assert_eq!(x.grad()?.to_vec()?, vec![2.0, 4.0, 6.0]);
//! ```

pub mod backend;
pub mod backward;
pub mod device;
pub mod dtype;
pub mod error;
pub mod finite_diff;
pub mod node;
pub mod op;
pub mod ops;
pub mod shape;
pub mod storage;

pub use backend::{Backend, BinaryOp, Conv2dParams, MatmulDims, ReduceOp, UnaryOp};
pub use backward::Gradients;
pub use device::{Config, Device, DeviceRegistry, ExecutionMode};
pub use dtype::{Buffer, DType, Element};
pub use error::{Result, TensorError};
pub use finite_diff::{check_gradients, finite_diff_grad, GradCheck};
pub use node::{NodeId, Tensor};
pub use op::TensorOp;
pub use shape::{Shape, ShapeIndices, Strides};
pub use storage::{NDArray, SliceRange};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::backward::Gradients;
    pub use crate::device::{Config, Device, DeviceRegistry, ExecutionMode};
    pub use crate::dtype::DType;
    pub use crate::error::{Result, TensorError};
    pub use crate::node::{NodeId, Tensor};
    pub use crate::op::TensorOp;
    pub use crate::shape::Shape;
    pub use crate::storage::{NDArray, SliceRange};
}
