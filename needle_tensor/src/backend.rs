//! Backend trait - abstraction for compute backends (CPU, accelerators).
//!
//! A backend only sees compact inputs whose output shape has already been
//! worked out by [`NDArray`]; it returns a fresh [`Buffer`] for that shape.
//! Every primitive defaults to `UnsupportedOperation` so a partial backend
//! fails loudly instead of quietly routing work elsewhere.

use std::fmt;

use crate::dtype::{Buffer, DType, Element};
use crate::error::{Result, TensorError};
use crate::shape::{Shape, Strides};
use crate::storage::NDArray;

/// Element-wise unary primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Tanh,
    Relu,
    Sqrt,
    Sigmoid,
}

impl UnaryOp {
    #[inline]
    pub fn apply<T: Element>(self, x: T) -> T {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Relu => x.max_of(T::zero()),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Sigmoid => T::one() / (T::one() + (-x).exp()),
        }
    }
}

/// Element-wise binary primitives. Comparisons produce 0/1 masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
    Eq,
    Ge,
    Gt,
}

impl BinaryOp {
    #[inline]
    pub fn apply<T: Element>(self, a: T, b: T) -> T {
        let mask = |c: bool| if c { T::one() } else { T::zero() };
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Maximum => a.max_of(b),
            BinaryOp::Eq => mask(a == b),
            BinaryOp::Ge => mask(a >= b),
            BinaryOp::Gt => mask(a > b),
        }
    }
}

/// Reductions over contiguous trailing blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// Dimensions of a batched matmul `(batch, m, n) @ (batch, n, p)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulDims {
    pub batch: usize,
    pub m: usize,
    pub n: usize,
    pub p: usize,
}

/// Geometry of a grouped 2D cross-correlation over NCHW input with an
/// `(out_channels, in_channels / groups, k, k)` kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
}

impl Conv2dParams {
    /// Validate input and kernel shapes and derive the geometry.
    pub fn new(
        input: &Shape,
        kernel: &Shape,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<Self> {
        if input.ndim() != 4 || kernel.ndim() != 4 {
            return Err(TensorError::shape_mismatch("conv2d", input, kernel));
        }
        if stride == 0 || groups == 0 {
            return Err(TensorError::invalid(format!(
                "conv2d needs stride >= 1 and groups >= 1, got stride={stride}, groups={groups}"
            )));
        }
        let (batch, in_channels, height, width) =
            (input.dim(0), input.dim(1), input.dim(2), input.dim(3));
        let (out_channels, group_in, kh, kw) =
            (kernel.dim(0), kernel.dim(1), kernel.dim(2), kernel.dim(3));

        if kh != kw
            || in_channels % groups != 0
            || out_channels % groups != 0
            || group_in != in_channels / groups
            || height + 2 * padding < kh
            || width + 2 * padding < kw
        {
            return Err(TensorError::shape_mismatch("conv2d", input, kernel));
        }

        Ok(Conv2dParams {
            batch,
            in_channels,
            height,
            width,
            out_channels,
            kernel_size: kh,
            stride,
            padding,
            groups,
        })
    }

    pub fn out_height(&self) -> usize {
        (self.height + 2 * self.padding - self.kernel_size) / self.stride + 1
    }

    pub fn out_width(&self) -> usize {
        (self.width + 2 * self.padding - self.kernel_size) / self.stride + 1
    }

    pub fn output_shape(&self) -> Shape {
        Shape::new(vec![
            self.batch,
            self.out_channels,
            self.out_height(),
            self.out_width(),
        ])
    }

    pub fn input_shape(&self) -> Shape {
        Shape::new(vec![self.batch, self.in_channels, self.height, self.width])
    }

    pub fn kernel_shape(&self) -> Shape {
        Shape::new(vec![
            self.out_channels,
            self.in_channels / self.groups,
            self.kernel_size,
            self.kernel_size,
        ])
    }
}

/// Backend trait for array computation.
/// Each backend (CPU, accelerators) implements this to provide the primitives.
pub trait Backend: Send + Sync + fmt::Debug {
    /// Device tag, e.g. "cpu".
    fn name(&self) -> &str;

    /// Capability query: can this backend run on the current machine?
    fn is_enabled(&self) -> bool {
        true
    }

    // === Layout ===

    /// Copy a strided view into a fresh contiguous buffer.
    fn compact(&self, _a: &NDArray) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "compact"))
    }

    /// Write the compact `src` into `dst` through the given strided layout.
    fn set_strided(
        &self,
        _dst: &mut Buffer,
        _src: &NDArray,
        _shape: &Shape,
        _strides: &Strides,
        _offset: usize,
    ) -> Result<()> {
        Err(TensorError::unsupported(self.name(), "set_strided"))
    }

    // === Creation ===

    /// Buffer of `len` elements all equal to `value`.
    fn fill(&self, _dtype: DType, _len: usize, _value: f64) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "fill"))
    }

    // === Element-wise ===

    fn unary(&self, _op: UnaryOp, _a: &NDArray) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "unary"))
    }

    /// `a` and `b` are compact and share one shape.
    fn binary(&self, _op: BinaryOp, _a: &NDArray, _b: &NDArray) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "binary"))
    }

    /// `dst = dst op src`, for an exclusively owned compact `dst`.
    fn binary_assign(&self, _op: BinaryOp, _dst: &mut Buffer, _src: &NDArray) -> Result<()> {
        Err(TensorError::unsupported(self.name(), "binary_assign"))
    }

    fn scalar(&self, _op: BinaryOp, _a: &NDArray, _value: f64) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "scalar"))
    }

    // === Reductions ===

    /// Reduce every contiguous block of `reduce_size` elements to one value.
    fn reduce(&self, _op: ReduceOp, _a: &NDArray, _reduce_size: usize) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "reduce"))
    }

    // === Linear algebra ===

    fn matmul(&self, _a: &NDArray, _b: &NDArray, _dims: MatmulDims) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "matmul"))
    }

    // === Convolution ===

    fn conv2d(&self, _x: &NDArray, _w: &NDArray, _params: &Conv2dParams) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "conv2d"))
    }

    /// Gradient w.r.t. the conv input: full correlation of `out_grad` with the
    /// spatially flipped kernel, within each group.
    fn conv2d_input_grad(
        &self,
        _out_grad: &NDArray,
        _w: &NDArray,
        _params: &Conv2dParams,
    ) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "conv2d_input_grad"))
    }

    /// Gradient w.r.t. the conv kernel: correlation of the input with
    /// `out_grad`, within each group.
    fn conv2d_weight_grad(
        &self,
        _x: &NDArray,
        _out_grad: &NDArray,
        _params: &Conv2dParams,
    ) -> Result<Buffer> {
        Err(TensorError::unsupported(self.name(), "conv2d_weight_grad"))
    }
}
