//! Graph-building methods on [`Tensor`].
//!
//! Every method validates its inputs and returns a new node; operands are
//! never mutated. Arithmetic operators return `Result<Tensor>` as well; the
//! operator traits are implemented by path so the inherent `&self` methods
//! stay the ones picked by method-call syntax.

use crate::error::{Result, TensorError};
use crate::node::Tensor;
use crate::op::TensorOp;
use crate::shape::Shape;
use crate::storage::SliceRange;

impl Tensor {
    fn unary_op(&self, op: TensorOp) -> Result<Tensor> {
        Tensor::from_op(op, vec![self.clone()])
    }

    fn binary_op(&self, op: TensorOp, other: &Tensor) -> Result<Tensor> {
        Tensor::from_op(op, vec![self.clone(), other.clone()])
    }

    // === Unary operations ===

    /// Negate: -self
    pub fn neg(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Neg)
    }

    /// Exponential: exp(self)
    pub fn exp(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Exp)
    }

    /// Natural log: ln(self)
    pub fn log(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Log)
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Tanh)
    }

    /// ReLU: max(0, self)
    pub fn relu(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Relu)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Sqrt)
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::Sigmoid)
    }

    // === Binary operations (broadcasting) ===

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Add, other)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Sub, other)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Mul, other)
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Div, other)
    }

    /// Element-wise power with a tensor exponent.
    pub fn pow(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Pow, other)
    }

    pub fn maximum(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::Maximum, other)
    }

    // === Scalar operations ===

    pub fn add_scalar(&self, c: f64) -> Result<Tensor> {
        self.unary_op(TensorOp::AddScalar(c))
    }

    pub fn mul_scalar(&self, c: f64) -> Result<Tensor> {
        self.unary_op(TensorOp::MulScalar(c))
    }

    pub fn div_scalar(&self, c: f64) -> Result<Tensor> {
        self.unary_op(TensorOp::DivScalar(c))
    }

    /// self ^ p for a scalar exponent.
    pub fn powf(&self, p: f64) -> Result<Tensor> {
        self.unary_op(TensorOp::PowScalar(p))
    }

    // === Reductions ===

    /// Sum over `axes` (None = all axes).
    pub fn sum(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.unary_op(TensorOp::Sum {
            axes: axes.map(<[usize]>::to_vec),
            keepdims,
        })
    }

    pub fn mean(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.unary_op(TensorOp::Mean {
            axes: axes.map(<[usize]>::to_vec),
            keepdims,
        })
    }

    pub fn max(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<Tensor> {
        self.unary_op(TensorOp::Max {
            axes: axes.map(<[usize]>::to_vec),
            keepdims,
        })
    }

    // === Linear algebra ===

    /// Batched matrix multiply over the trailing two axes.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary_op(TensorOp::MatMul, other)
    }

    // === Shape operations ===

    pub fn permute(&self, axes: &[usize]) -> Result<Tensor> {
        self.unary_op(TensorOp::Permute {
            axes: axes.to_vec(),
        })
    }

    /// Permute axes; `None` reverses them.
    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Tensor> {
        match axes {
            Some(axes) => self.permute(axes),
            None => {
                let reversed: Vec<usize> = (0..self.ndim()).rev().collect();
                self.permute(&reversed)
            }
        }
    }

    /// Swap the last two axes.
    pub fn t(&self) -> Result<Tensor> {
        let n = self.ndim();
        if n < 2 {
            return Err(TensorError::InvalidAxis { axis: 1, ndim: n });
        }
        let mut axes: Vec<usize> = (0..n).collect();
        axes.swap(n - 2, n - 1);
        self.permute(&axes)
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.unary_op(TensorOp::Reshape {
            shape: shape.into(),
        })
    }

    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        self.unary_op(TensorOp::BroadcastTo {
            shape: shape.into(),
        })
    }

    /// Strided slice with one range per axis.
    pub fn slice(&self, ranges: &[SliceRange]) -> Result<Tensor> {
        self.unary_op(TensorOp::Slice {
            ranges: ranges.to_vec(),
        })
    }

    /// Take `index` along `axis`, dropping the axis.
    pub fn select(&self, axis: usize, index: usize) -> Result<Tensor> {
        self.unary_op(TensorOp::Select { axis, index })
    }

    /// Split along `axis` into one tensor per index.
    pub fn split(&self, axis: usize) -> Result<Vec<Tensor>> {
        let axis = self.shape().check_axis(axis)?;
        (0..self.shape().dim(axis))
            .map(|index| self.select(axis, index))
            .collect()
    }

    /// Join equal-shaped tensors along a new `axis`.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Result<Tensor> {
        Tensor::from_op(TensorOp::Stack { axis }, tensors.to_vec())
    }

    // === Convolution ===

    /// Grouped 2D cross-correlation. `self` is NCHW, `weight` is
    /// `(out_channels, in_channels / groups, k, k)`.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<Tensor> {
        self.binary_op(
            TensorOp::Conv2d {
                stride,
                padding,
                groups,
            },
            weight,
        )
    }

    /// Same values, but gradients stop here. Unlike [`Tensor::detach`] this
    /// is a graph node, so nothing is computed until it is read.
    pub fn stop_gradient(&self) -> Result<Tensor> {
        self.unary_op(TensorOp::StopGradient)
    }

    // === Composites ===

    /// Softmax along `axis`, stabilized by subtracting the max, with gradients stopped at the max.
    pub fn softmax(&self, axis: usize) -> Result<Tensor> {
        let shifted = self.sub(&self.max(Some(&[axis]), true)?.stop_gradient()?)?;
        let e = shifted.exp()?;
        e.div(&e.sum(Some(&[axis]), true)?)
    }

    /// Log-softmax along `axis`: `x - max - log(sum(exp(x - max)))`.
    pub fn log_softmax(&self, axis: usize) -> Result<Tensor> {
        let shifted = self.sub(&self.max(Some(&[axis]), true)?.stop_gradient()?)?;
        let log_norm = shifted.exp()?.sum(Some(&[axis]), true)?.log()?;
        shifted.sub(&log_norm)
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                Tensor::$method(self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for &Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                Tensor::$method(self, &rhs)
            }
        }

        impl std::ops::$trait<&Tensor> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: &Tensor) -> Result<Tensor> {
                Tensor::$method(&self, rhs)
            }
        }

        impl std::ops::$trait<Tensor> for Tensor {
            type Output = Result<Tensor>;
            fn $method(self, rhs: Tensor) -> Result<Tensor> {
                Tensor::$method(&self, &rhs)
            }
        }
    };
}

impl_binary_operator!(Add, add);
impl_binary_operator!(Sub, sub);
impl_binary_operator!(Mul, mul);
impl_binary_operator!(Div, div);

impl std::ops::Add<f64> for &Tensor {
    type Output = Result<Tensor>;
    fn add(self, rhs: f64) -> Result<Tensor> {
        self.add_scalar(rhs)
    }
}

impl std::ops::Sub<f64> for &Tensor {
    type Output = Result<Tensor>;
    fn sub(self, rhs: f64) -> Result<Tensor> {
        self.add_scalar(-rhs)
    }
}

impl std::ops::Mul<f64> for &Tensor {
    type Output = Result<Tensor>;
    fn mul(self, rhs: f64) -> Result<Tensor> {
        self.mul_scalar(rhs)
    }
}

impl std::ops::Div<f64> for &Tensor {
    type Output = Result<Tensor>;
    fn div(self, rhs: f64) -> Result<Tensor> {
        self.div_scalar(rhs)
    }
}

impl std::ops::Neg for &Tensor {
    type Output = Result<Tensor>;
    fn neg(self) -> Result<Tensor> {
        Tensor::neg(self)
    }
}

impl std::ops::Neg for Tensor {
    type Output = Result<Tensor>;
    fn neg(self) -> Result<Tensor> {
        Tensor::neg(&self)
    }
}
