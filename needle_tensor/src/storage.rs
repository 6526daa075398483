//! Strided N-dimensional storage.
//!
//! An [`NDArray`] is a view: shape, strides and offset over a shared
//! [`Buffer`]. Structural ops (`reshape`, `broadcast_to`, `permute`, `slice`,
//! `select`) only rewrite metadata. Compute ops compact their inputs, validate
//! shapes, dtypes and devices, then hand off to the device's backend.

use std::fmt;
use std::sync::Arc;

use crate::backend::{BinaryOp, Conv2dParams, MatmulDims, ReduceOp, UnaryOp};
use crate::device::Device;
use crate::dtype::{Buffer, DType, Element};
use crate::error::{Result, TensorError};
use crate::shape::{Shape, ShapeIndices, Strides};

/// `start..stop` along one axis, walked with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SliceRange {
    pub start: usize,
    pub stop: usize,
    pub step: usize,
}

impl SliceRange {
    pub fn new(start: usize, stop: usize, step: usize) -> Self {
        SliceRange { start, stop, step }
    }

    /// The whole axis.
    pub fn full(dim: usize) -> Self {
        SliceRange::new(0, dim, 1)
    }

    /// A single index, keeping the axis with length 1.
    pub fn at(index: usize) -> Self {
        SliceRange::new(index, index + 1, 1)
    }

    pub fn len(&self) -> usize {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start).div_ceil(self.step)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shape picked out of `shape` by `ranges` (one range per axis).
pub(crate) fn sliced_shape(shape: &Shape, ranges: &[SliceRange]) -> Result<Shape> {
    if ranges.len() != shape.ndim() {
        return Err(TensorError::invalid(format!(
            "slice needs {} ranges, got {}",
            shape.ndim(),
            ranges.len()
        )));
    }
    let mut dims = Vec::with_capacity(ranges.len());
    for (axis, r) in ranges.iter().enumerate() {
        if r.step == 0 || r.start > r.stop || r.stop > shape.dim(axis) {
            return Err(TensorError::invalid(format!(
                "slice {}..{} step {} out of bounds for axis {axis} of size {}",
                r.start,
                r.stop,
                r.step,
                shape.dim(axis)
            )));
        }
        dims.push(r.len());
    }
    Ok(Shape::new(dims))
}

/// Validate that `axes` is a permutation of `0..shape.ndim()` and apply it.
pub(crate) fn permuted_shape(shape: &Shape, axes: &[usize]) -> Result<Shape> {
    let ndim = shape.ndim();
    let mut seen = vec![false; ndim];
    if axes.len() != ndim {
        return Err(TensorError::invalid(format!(
            "permutation {axes:?} does not match rank {ndim}"
        )));
    }
    for &ax in axes {
        shape.check_axis(ax)?;
        if std::mem::replace(&mut seen[ax], true) {
            return Err(TensorError::invalid(format!(
                "permutation {axes:?} repeats axis {ax}"
            )));
        }
    }
    Ok(Shape::new(axes.iter().map(|&ax| shape.dim(ax)).collect()))
}

/// Broadcast batch shape and the `(m, n, p)` of `a @ b`.
pub(crate) fn matmul_dims(a: &Shape, b: &Shape) -> Result<(Shape, usize, usize, usize)> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(TensorError::shape_mismatch("matmul", a, b));
    }
    let (ra, rb) = (a.ndim(), b.ndim());
    let (m, n) = (a.dim(ra - 2), a.dim(ra - 1));
    let (n2, p) = (b.dim(rb - 2), b.dim(rb - 1));
    if n != n2 {
        return Err(TensorError::shape_mismatch("matmul", a, b));
    }
    let batch_a = Shape::from(&a.dims()[..ra - 2]);
    let batch_b = Shape::from(&b.dims()[..rb - 2]);
    let batch = batch_a
        .broadcast_with(&batch_b)
        .ok_or_else(|| TensorError::shape_mismatch("matmul", a, b))?;
    Ok((batch, m, n, p))
}

pub(crate) fn matmul_shape(a: &Shape, b: &Shape) -> Result<Shape> {
    let (batch, m, _, p) = matmul_dims(a, b)?;
    let mut dims = batch.0;
    dims.extend([m, p]);
    Ok(Shape::new(dims))
}

/// Output shape of stacking `count` arrays of `shape` along a new `axis`.
pub(crate) fn stacked_shape(shape: &Shape, count: usize, axis: usize) -> Result<Shape> {
    if axis > shape.ndim() {
        return Err(TensorError::InvalidAxis {
            axis,
            ndim: shape.ndim() + 1,
        });
    }
    let mut dims = shape.0.clone();
    dims.insert(axis, count);
    Ok(Shape::new(dims))
}

fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Pow => "pow",
        BinaryOp::Maximum => "maximum",
        BinaryOp::Eq => "eq",
        BinaryOp::Ge => "ge",
        BinaryOp::Gt => "gt",
    }
}

/// Strided view over a device buffer.
#[derive(Clone)]
pub struct NDArray {
    buffer: Arc<Buffer>,
    shape: Shape,
    strides: Strides,
    offset: usize,
    device: Device,
}

impl NDArray {
    // === Construction ===

    /// Wrap a buffer holding exactly `shape.numel()` elements in row-major order.
    pub fn from_buffer(buffer: Buffer, shape: Shape, device: Device) -> Result<Self> {
        if buffer.len() != shape.numel() {
            return Err(TensorError::invalid(format!(
                "buffer of {} elements cannot hold shape {shape}",
                buffer.len()
            )));
        }
        let strides = shape.contiguous_strides();
        Ok(NDArray {
            buffer: Arc::new(buffer),
            shape,
            strides,
            offset: 0,
            device,
        })
    }

    pub fn from_vec<T: Element>(
        data: Vec<T>,
        shape: impl Into<Shape>,
        device: &Device,
    ) -> Result<Self> {
        Self::from_buffer(T::into_buffer(data), shape.into(), device.clone())
    }

    /// Build from f64 values, converting to `dtype`.
    pub fn from_f64(
        values: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::from_buffer(Buffer::from_f64(dtype, values), shape.into(), device.clone())
    }

    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType, device: &Device) -> Result<Self> {
        let shape = shape.into();
        let buffer = device.backend().fill(dtype, shape.numel(), value)?;
        Self::from_buffer(buffer, shape, device.clone())
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Self> {
        Self::full(shape, 0.0, dtype, device)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// New array on the same device and dtype as `self`.
    pub fn full_like(&self, shape: impl Into<Shape>, value: f64) -> Result<Self> {
        Self::full(shape, value, self.dtype(), &self.device)
    }

    fn with_buffer(&self, buffer: Buffer, shape: Shape) -> Result<Self> {
        if buffer.dtype() != self.dtype() {
            return Err(TensorError::DtypeMismatch {
                op: "backend output",
                lhs: self.dtype(),
                rhs: buffer.dtype(),
            });
        }
        Self::from_buffer(buffer, shape, self.device.clone())
    }

    fn view(&self, shape: Shape, strides: Strides, offset: usize) -> Self {
        NDArray {
            buffer: Arc::clone(&self.buffer),
            shape,
            strides,
            offset,
            device: self.device.clone(),
        }
    }

    // === Accessors ===

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Row-major, zero offset, and the buffer holds nothing else.
    pub fn is_compact(&self) -> bool {
        self.offset == 0
            && self.buffer.len() == self.numel()
            && self.strides == self.shape.contiguous_strides()
    }

    /// True when `self` and `other` are views of the same buffer.
    pub fn shares_buffer(&self, other: &NDArray) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Typed slice over a compact array.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        if !self.is_compact() {
            return Err(TensorError::invalid("as_slice requires a compact array"));
        }
        T::slice_of(&self.buffer).ok_or(TensorError::DtypeMismatch {
            op: "as_slice",
            lhs: T::DTYPE,
            rhs: self.dtype(),
        })
    }

    // === Readout ===

    /// Values in row-major order, converted to f64.
    pub fn to_vec_f64(&self) -> Result<Vec<f64>> {
        Ok(ShapeIndices::new(&self.shape)
            .map(|idx| self.buffer.get_f64(self.offset + self.strides.index(&idx)))
            .collect())
    }

    /// The single value of a one-element array.
    pub fn item(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(TensorError::invalid(format!(
                "item() needs exactly one element, shape is {}",
                self.shape
            )));
        }
        let zero_idx = vec![0; self.ndim()];
        Ok(self
            .buffer
            .get_f64(self.offset + self.strides.index(&zero_idx)))
    }

    // === Layout ===

    /// Contiguous copy through the backend; a compact array is returned as is.
    pub fn compact(&self) -> Result<NDArray> {
        if self.is_compact() {
            return Ok(self.clone());
        }
        let buffer = self.device.backend().compact(self)?;
        self.with_buffer(buffer, self.shape.clone())
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<NDArray> {
        let shape = shape.into();
        if shape.numel() != self.numel() {
            return Err(TensorError::shape_mismatch("reshape", &self.shape, &shape));
        }
        let base = self.compact()?;
        let strides = shape.contiguous_strides();
        Ok(base.view(shape, strides, 0))
    }

    /// Stretch size-1 and missing leading axes with stride 0.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<NDArray> {
        let target = shape.into();
        if target == self.shape {
            return Ok(self.clone());
        }
        if !self.shape.broadcastable_to(&target) {
            return Err(TensorError::shape_mismatch(
                "broadcast_to",
                &self.shape,
                &target,
            ));
        }
        let lead = target.ndim() - self.ndim();
        let mut strides = vec![0; target.ndim()];
        for (i, &d) in self.shape.dims().iter().enumerate() {
            strides[lead + i] = if d == 1 && target.dim(lead + i) != 1 {
                0
            } else {
                self.strides.0[i]
            };
        }
        Ok(self.view(target, Strides(strides), self.offset))
    }

    pub fn permute(&self, axes: &[usize]) -> Result<NDArray> {
        let shape = permuted_shape(&self.shape, axes)?;
        let strides = Strides(axes.iter().map(|&ax| self.strides.0[ax]).collect());
        Ok(self.view(shape, strides, self.offset))
    }

    /// Batched transpose of the trailing two axes.
    pub fn swap_last_axes(&self) -> Result<NDArray> {
        let n = self.ndim();
        if n < 2 {
            return Err(TensorError::InvalidAxis { axis: 1, ndim: n });
        }
        let mut axes: Vec<usize> = (0..n).collect();
        axes.swap(n - 2, n - 1);
        self.permute(&axes)
    }

    pub fn slice(&self, ranges: &[SliceRange]) -> Result<NDArray> {
        let shape = sliced_shape(&self.shape, ranges)?;
        let mut offset = self.offset;
        let mut strides = Vec::with_capacity(ranges.len());
        for (r, &s) in ranges.iter().zip(self.strides.as_slice()) {
            offset += r.start * s;
            strides.push(s * r.step);
        }
        Ok(self.view(shape, Strides(strides), offset))
    }

    /// Take `index` along `axis` and drop that axis.
    pub fn select(&self, axis: usize, index: usize) -> Result<NDArray> {
        let axis = self.shape.check_axis(axis)?;
        if index >= self.shape.dim(axis) {
            return Err(TensorError::invalid(format!(
                "index {index} out of bounds for axis {axis} of size {}",
                self.shape.dim(axis)
            )));
        }
        let ranges: Vec<SliceRange> = (0..self.ndim())
            .map(|ax| {
                if ax == axis {
                    SliceRange::at(index)
                } else {
                    SliceRange::full(self.shape.dim(ax))
                }
            })
            .collect();
        let picked = self.slice(&ranges)?;
        let mut dims = picked.shape.0.clone();
        let mut strides = picked.strides.0.clone();
        dims.remove(axis);
        strides.remove(axis);
        Ok(picked.view(Shape::new(dims), Strides(strides), picked.offset))
    }

    // === Writes (always into a fresh buffer) ===

    /// Copy of `self` with the region picked by `ranges` overwritten by
    /// `value`, broadcast to the region's shape.
    pub fn set_slice(&self, ranges: &[SliceRange], value: &NDArray) -> Result<NDArray> {
        self.check_compatible("setitem", value)?;
        let region = sliced_shape(&self.shape, ranges)?;
        let value = value.broadcast_to(region.clone())?.compact()?;

        let contiguous = self.shape.contiguous_strides();
        let offset = ranges
            .iter()
            .zip(contiguous.as_slice())
            .map(|(r, &s)| r.start * s)
            .sum();
        let strides = Strides(
            ranges
                .iter()
                .zip(contiguous.as_slice())
                .map(|(r, &s)| r.step * s)
                .collect(),
        );

        let mut buffer = Buffer::clone(self.compact()?.buffer());
        self.device
            .backend()
            .set_strided(&mut buffer, &value, &region, &strides, offset)?;
        self.with_buffer(buffer, self.shape.clone())
    }

    /// Join equal-shaped arrays along a new `axis`.
    pub fn stack(arrays: &[NDArray], axis: usize) -> Result<NDArray> {
        let first = arrays
            .first()
            .ok_or_else(|| TensorError::invalid("stack needs at least one array"))?;
        for a in &arrays[1..] {
            first.check_compatible("stack", a)?;
            if a.shape != first.shape {
                return Err(TensorError::shape_mismatch("stack", &first.shape, &a.shape));
            }
        }
        let out_shape = stacked_shape(&first.shape, arrays.len(), axis)?;
        let backend = first.device.backend();
        let mut buffer = backend.fill(first.dtype(), out_shape.numel(), 0.0)?;

        let contiguous = out_shape.contiguous_strides();
        let mut strides = contiguous.0.clone();
        let step = strides.remove(axis);
        let strides = Strides(strides);
        for (i, a) in arrays.iter().enumerate() {
            let src = a.compact()?;
            backend.set_strided(&mut buffer, &src, &a.shape, &strides, i * step)?;
        }
        first.with_buffer(buffer, out_shape)
    }

    /// `self += other` in place when the buffer is compact and not aliased by
    /// any other view; otherwise `self` is rebound to a freshly allocated sum.
    pub fn try_add_assign(&mut self, other: &NDArray) -> Result<()> {
        self.check_compatible("accumulate", other)?;
        if self.shape != other.shape {
            return Err(TensorError::shape_mismatch(
                "accumulate",
                &self.shape,
                &other.shape,
            ));
        }
        if self.is_compact() {
            let device = self.device.clone();
            if let Some(buffer) = Arc::get_mut(&mut self.buffer) {
                let src = other.compact()?;
                return device.backend().binary_assign(BinaryOp::Add, buffer, &src);
            }
        }
        *self = self.binary(BinaryOp::Add, other)?;
        Ok(())
    }

    // === Compute ===

    fn check_compatible(&self, op: &'static str, other: &NDArray) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(TensorError::DtypeMismatch {
                op,
                lhs: self.dtype(),
                rhs: other.dtype(),
            });
        }
        if self.device != other.device {
            return Err(TensorError::DeviceMismatch {
                op,
                lhs: self.device.name().to_string(),
                rhs: other.device.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn unary(&self, op: UnaryOp) -> Result<NDArray> {
        let a = self.compact()?;
        let buffer = self.device.backend().unary(op, &a)?;
        self.with_buffer(buffer, self.shape.clone())
    }

    /// Element-wise op with broadcasting.
    pub fn binary(&self, op: BinaryOp, other: &NDArray) -> Result<NDArray> {
        let name = binary_name(op);
        self.check_compatible(name, other)?;
        let shape = self.shape.broadcast_for(&other.shape, name)?;
        let a = self.broadcast_to(shape.clone())?.compact()?;
        let b = other.broadcast_to(shape.clone())?.compact()?;
        let buffer = self.device.backend().binary(op, &a, &b)?;
        self.with_buffer(buffer, shape)
    }

    /// Element-wise op against a scalar right-hand side.
    pub fn scalar(&self, op: BinaryOp, value: f64) -> Result<NDArray> {
        let a = self.compact()?;
        let buffer = self.device.backend().scalar(op, &a, value)?;
        self.with_buffer(buffer, self.shape.clone())
    }

    pub fn add(&self, other: &NDArray) -> Result<NDArray> {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(&self, other: &NDArray) -> Result<NDArray> {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(&self, other: &NDArray) -> Result<NDArray> {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(&self, other: &NDArray) -> Result<NDArray> {
        self.binary(BinaryOp::Div, other)
    }

    pub fn neg(&self) -> Result<NDArray> {
        self.unary(UnaryOp::Neg)
    }

    /// Reduce over `axes` (None = all). Reduced axes are moved to the back
    /// and compacted so the backend sees contiguous blocks.
    pub fn reduce(&self, op: ReduceOp, axes: Option<&[usize]>, keepdims: bool) -> Result<NDArray> {
        let axes = self.shape.resolve_axes(axes)?;
        let out_shape = self.shape.reduced(&axes, keepdims);
        let reduce_size: usize = axes.iter().map(|&ax| self.shape.dim(ax)).product();

        if reduce_size == 0 {
            let identity = match op {
                ReduceOp::Sum => 0.0,
                ReduceOp::Max => f64::NEG_INFINITY,
            };
            return self.full_like(out_shape, identity);
        }

        let mut order: Vec<usize> = (0..self.ndim()).filter(|ax| !axes.contains(ax)).collect();
        order.extend(&axes);
        let moved = self.permute(&order)?.compact()?;
        let buffer = self.device.backend().reduce(op, &moved, reduce_size)?;
        self.with_buffer(buffer, out_shape)
    }

    pub fn sum(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<NDArray> {
        self.reduce(ReduceOp::Sum, axes, keepdims)
    }

    pub fn max(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<NDArray> {
        self.reduce(ReduceOp::Max, axes, keepdims)
    }

    /// Un-broadcast: sum over the axes that were introduced or stretched to
    /// go from `shape` to `self.shape()`.
    pub fn sum_to(&self, shape: &Shape) -> Result<NDArray> {
        if &self.shape == shape {
            return Ok(self.clone());
        }
        if !shape.broadcastable_to(&self.shape) {
            return Err(TensorError::shape_mismatch("sum_to", &self.shape, shape));
        }
        let axes = shape.reduction_axes_from(&self.shape);
        self.sum(Some(&axes), false)?.reshape(shape.clone())
    }

    /// Batched matrix multiply; batch dimensions broadcast.
    pub fn matmul(&self, other: &NDArray) -> Result<NDArray> {
        self.check_compatible("matmul", other)?;
        let (batch, m, n, p) = matmul_dims(&self.shape, &other.shape)?;

        let with_tail = |tail: [usize; 2]| {
            let mut dims = batch.0.clone();
            dims.extend(tail);
            Shape::new(dims)
        };
        let a = self.broadcast_to(with_tail([m, n]))?.compact()?;
        let b = other.broadcast_to(with_tail([n, p]))?.compact()?;
        let dims = MatmulDims {
            batch: batch.numel(),
            m,
            n,
            p,
        };
        let buffer = self.device.backend().matmul(&a, &b, dims)?;
        self.with_buffer(buffer, with_tail([m, p]))
    }

    /// Grouped 2D cross-correlation of NCHW `self` with `weight`.
    pub fn conv2d(
        &self,
        weight: &NDArray,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<NDArray> {
        self.check_compatible("conv2d", weight)?;
        let params = Conv2dParams::new(&self.shape, &weight.shape, stride, padding, groups)?;
        let x = self.compact()?;
        let w = weight.compact()?;
        let buffer = self.device.backend().conv2d(&x, &w, &params)?;
        self.with_buffer(buffer, params.output_shape())
    }

    /// Gradient w.r.t. the conv input, with `self` as the output gradient.
    pub fn conv2d_input_grad(&self, weight: &NDArray, params: &Conv2dParams) -> Result<NDArray> {
        self.check_compatible("conv2d_input_grad", weight)?;
        self.check_conv_out(params)?;
        let g = self.compact()?;
        let w = weight.compact()?;
        let buffer = self.device.backend().conv2d_input_grad(&g, &w, params)?;
        self.with_buffer(buffer, params.input_shape())
    }

    /// Gradient w.r.t. the conv kernel, with `self` as the conv input.
    pub fn conv2d_weight_grad(&self, out_grad: &NDArray, params: &Conv2dParams) -> Result<NDArray> {
        self.check_compatible("conv2d_weight_grad", out_grad)?;
        out_grad.check_conv_out(params)?;
        let x = self.compact()?;
        let g = out_grad.compact()?;
        let buffer = self.device.backend().conv2d_weight_grad(&x, &g, params)?;
        self.with_buffer(buffer, params.kernel_shape())
    }

    fn check_conv_out(&self, params: &Conv2dParams) -> Result<()> {
        let expected = params.output_shape();
        if self.shape != expected {
            return Err(TensorError::shape_mismatch("conv2d", &self.shape, &expected));
        }
        Ok(())
    }
}

impl fmt::Debug for NDArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NDArray")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("device", &self.device.name())
            .field("compact", &self.is_compact())
            .finish()
    }
}
