//! The closed set of differentiable operators.
//!
//! Each variant carries its scalar attributes. Shape inference and forward
//! compute live here; the matching gradient rules live in `backward.rs`.

use crate::backend::{BinaryOp, Conv2dParams, ReduceOp, UnaryOp};
use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::storage::{matmul_shape, permuted_shape, sliced_shape, stacked_shape, NDArray, SliceRange};

/// Operations in the computation graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorOp {
    // === Leaf ===
    /// Input, parameter or constant; no provenance.
    Leaf,

    // === Unary element-wise ===
    Neg,
    Exp,
    Log,
    Tanh,
    Relu,
    Sqrt,
    Sigmoid,

    // === Binary element-wise (broadcasting) ===
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,

    // === Scalar right-hand side ===
    AddScalar(f64),
    MulScalar(f64),
    DivScalar(f64),
    PowScalar(f64),

    // === Reductions ===
    Sum {
        axes: Option<Vec<usize>>,
        keepdims: bool,
    },
    Mean {
        axes: Option<Vec<usize>>,
        keepdims: bool,
    },
    Max {
        axes: Option<Vec<usize>>,
        keepdims: bool,
    },

    // === Linear algebra ===
    MatMul,

    // === Structural ===
    Permute {
        axes: Vec<usize>,
    },
    Reshape {
        shape: Shape,
    },
    BroadcastTo {
        shape: Shape,
    },
    Slice {
        ranges: Vec<SliceRange>,
    },
    Select {
        axis: usize,
        index: usize,
    },
    Stack {
        axis: usize,
    },

    // === Convolution ===
    Conv2d {
        stride: usize,
        padding: usize,
        groups: usize,
    },

    // === Gradient control ===
    /// Identity on values; the result never requires grad.
    StopGradient,
}

impl TensorOp {
    pub fn name(&self) -> &'static str {
        match self {
            TensorOp::Leaf => "leaf",
            TensorOp::Neg => "neg",
            TensorOp::Exp => "exp",
            TensorOp::Log => "log",
            TensorOp::Tanh => "tanh",
            TensorOp::Relu => "relu",
            TensorOp::Sqrt => "sqrt",
            TensorOp::Sigmoid => "sigmoid",
            TensorOp::Add => "add",
            TensorOp::Sub => "sub",
            TensorOp::Mul => "mul",
            TensorOp::Div => "div",
            TensorOp::Pow => "pow",
            TensorOp::Maximum => "maximum",
            TensorOp::AddScalar(_) => "add_scalar",
            TensorOp::MulScalar(_) => "mul_scalar",
            TensorOp::DivScalar(_) => "div_scalar",
            TensorOp::PowScalar(_) => "pow_scalar",
            TensorOp::Sum { .. } => "sum",
            TensorOp::Mean { .. } => "mean",
            TensorOp::Max { .. } => "max",
            TensorOp::MatMul => "matmul",
            TensorOp::Permute { .. } => "permute",
            TensorOp::Reshape { .. } => "reshape",
            TensorOp::BroadcastTo { .. } => "broadcast_to",
            TensorOp::Slice { .. } => "slice",
            TensorOp::Select { .. } => "select",
            TensorOp::Stack { .. } => "stack",
            TensorOp::Conv2d { .. } => "conv2d",
            TensorOp::StopGradient => "stop_gradient",
        }
    }

    /// Number of inputs the op consumes; `None` for variadic ops.
    pub fn arity(&self) -> Option<usize> {
        match self {
            TensorOp::Leaf => Some(0),
            TensorOp::Add
            | TensorOp::Sub
            | TensorOp::Mul
            | TensorOp::Div
            | TensorOp::Pow
            | TensorOp::Maximum
            | TensorOp::MatMul
            | TensorOp::Conv2d { .. } => Some(2),
            TensorOp::Stack { .. } => None,
            _ => Some(1),
        }
    }

    /// Output shape for the given input shapes. Rejects malformed
    /// attributes and incompatible shapes before anything is computed.
    pub fn output_shape(&self, inputs: &[&Shape]) -> Result<Shape> {
        if let Some(n) = self.arity() {
            if inputs.len() != n {
                return Err(TensorError::invalid(format!(
                    "{} expects {n} inputs, got {}",
                    self.name(),
                    inputs.len()
                )));
            }
        }

        match self {
            TensorOp::Leaf => Err(TensorError::invalid("leaf nodes have no inputs")),

            TensorOp::Neg
            | TensorOp::Exp
            | TensorOp::Log
            | TensorOp::Tanh
            | TensorOp::Relu
            | TensorOp::Sqrt
            | TensorOp::Sigmoid
            | TensorOp::AddScalar(_)
            | TensorOp::MulScalar(_)
            | TensorOp::DivScalar(_)
            | TensorOp::PowScalar(_)
            | TensorOp::StopGradient => Ok(inputs[0].clone()),

            TensorOp::Add
            | TensorOp::Sub
            | TensorOp::Mul
            | TensorOp::Div
            | TensorOp::Pow
            | TensorOp::Maximum => inputs[0].broadcast_for(inputs[1], self.name()),

            TensorOp::Sum { axes, keepdims }
            | TensorOp::Mean { axes, keepdims }
            | TensorOp::Max { axes, keepdims } => {
                let axes = inputs[0].resolve_axes(axes.as_deref())?;
                Ok(inputs[0].reduced(&axes, *keepdims))
            }

            TensorOp::MatMul => matmul_shape(inputs[0], inputs[1]),

            TensorOp::Permute { axes } => permuted_shape(inputs[0], axes),

            TensorOp::Reshape { shape } => {
                if shape.numel() != inputs[0].numel() {
                    return Err(TensorError::shape_mismatch("reshape", inputs[0], shape));
                }
                Ok(shape.clone())
            }

            TensorOp::BroadcastTo { shape } => {
                if !inputs[0].broadcastable_to(shape) {
                    return Err(TensorError::shape_mismatch("broadcast_to", inputs[0], shape));
                }
                Ok(shape.clone())
            }

            TensorOp::Slice { ranges } => sliced_shape(inputs[0], ranges),

            TensorOp::Select { axis, index } => {
                let axis = inputs[0].check_axis(*axis)?;
                if *index >= inputs[0].dim(axis) {
                    return Err(TensorError::invalid(format!(
                        "index {index} out of bounds for axis {axis} of size {}",
                        inputs[0].dim(axis)
                    )));
                }
                let mut dims = inputs[0].0.clone();
                dims.remove(axis);
                Ok(Shape::new(dims))
            }

            TensorOp::Stack { axis } => {
                let first = inputs
                    .first()
                    .ok_or_else(|| TensorError::invalid("stack needs at least one input"))?;
                if let Some(other) = inputs.iter().find(|s| *s != first) {
                    return Err(TensorError::shape_mismatch("stack", first, other));
                }
                stacked_shape(first, inputs.len(), *axis)
            }

            TensorOp::Conv2d {
                stride,
                padding,
                groups,
            } => Ok(Conv2dParams::new(inputs[0], inputs[1], *stride, *padding, *groups)?
                .output_shape()),
        }
    }

    /// Forward compute over realized inputs.
    pub fn compute(&self, inputs: &[&NDArray]) -> Result<NDArray> {
        match self {
            TensorOp::Leaf => Err(TensorError::invalid("leaf nodes are never computed")),

            TensorOp::Neg => inputs[0].unary(UnaryOp::Neg),
            TensorOp::Exp => inputs[0].unary(UnaryOp::Exp),
            TensorOp::Log => inputs[0].unary(UnaryOp::Log),
            TensorOp::Tanh => inputs[0].unary(UnaryOp::Tanh),
            TensorOp::Relu => inputs[0].unary(UnaryOp::Relu),
            TensorOp::Sqrt => inputs[0].unary(UnaryOp::Sqrt),
            TensorOp::Sigmoid => inputs[0].unary(UnaryOp::Sigmoid),

            TensorOp::Add => inputs[0].binary(BinaryOp::Add, inputs[1]),
            TensorOp::Sub => inputs[0].binary(BinaryOp::Sub, inputs[1]),
            TensorOp::Mul => inputs[0].binary(BinaryOp::Mul, inputs[1]),
            TensorOp::Div => inputs[0].binary(BinaryOp::Div, inputs[1]),
            TensorOp::Pow => inputs[0].binary(BinaryOp::Pow, inputs[1]),
            TensorOp::Maximum => inputs[0].binary(BinaryOp::Maximum, inputs[1]),

            TensorOp::AddScalar(c) => inputs[0].scalar(BinaryOp::Add, *c),
            TensorOp::MulScalar(c) => inputs[0].scalar(BinaryOp::Mul, *c),
            TensorOp::DivScalar(c) => inputs[0].scalar(BinaryOp::Div, *c),
            TensorOp::PowScalar(p) => inputs[0].scalar(BinaryOp::Pow, *p),

            TensorOp::Sum { axes, keepdims } => {
                inputs[0].reduce(ReduceOp::Sum, axes.as_deref(), *keepdims)
            }
            TensorOp::Mean { axes, keepdims } => {
                let x = inputs[0];
                let resolved = x.shape().resolve_axes(axes.as_deref())?;
                let count: usize = resolved.iter().map(|&ax| x.shape().dim(ax)).product();
                x.reduce(ReduceOp::Sum, Some(&resolved), *keepdims)?
                    .scalar(BinaryOp::Div, count as f64)
            }
            TensorOp::Max { axes, keepdims } => {
                inputs[0].reduce(ReduceOp::Max, axes.as_deref(), *keepdims)
            }

            TensorOp::MatMul => inputs[0].matmul(inputs[1]),

            TensorOp::Permute { axes } => inputs[0].permute(axes),
            TensorOp::Reshape { shape } => inputs[0].reshape(shape.clone()),
            TensorOp::BroadcastTo { shape } => inputs[0].broadcast_to(shape.clone()),
            TensorOp::Slice { ranges } => inputs[0].slice(ranges),
            TensorOp::Select { axis, index } => inputs[0].select(*axis, *index),
            TensorOp::Stack { axis } => {
                let owned: Vec<NDArray> = inputs.iter().map(|a| (*a).clone()).collect();
                NDArray::stack(&owned, *axis)
            }

            TensorOp::Conv2d {
                stride,
                padding,
                groups,
            } => inputs[0].conv2d(inputs[1], *stride, *padding, *groups),

            TensorOp::StopGradient => Ok(inputs[0].clone()),
        }
    }
}
