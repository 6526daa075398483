//! CPU Backend for needle_tensor.
//!
//! Kernels are written once over [`Element`] and dispatched on the buffer's
//! dtype. Inputs arrive compact (except for `compact` itself), so most
//! kernels are straight loops over slices.

use log::trace;

use needle_tensor::backend::{Backend, BinaryOp, Conv2dParams, MatmulDims, ReduceOp, UnaryOp};
use needle_tensor::prelude::*;
use needle_tensor::{Buffer, Element, ShapeIndices, Strides};

/// Side of the square blocks used by the tiled matmul kernel.
pub const TILE: usize = 8;

/// Dispatch `$body` with `$T` bound to the element type of `$dtype`.
macro_rules! with_dtype {
    ($dtype:expr, $T:ident => $body:expr) => {
        match $dtype {
            DType::Float32 => {
                type $T = f32;
                $body
            }
            DType::Float64 => {
                type $T = f64;
                $body
            }
        }
    };
}

/// CPU backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub const NAME: &'static str = "cpu";
}

/// Handle to the CPU backend.
pub fn cpu() -> Device {
    Device::new(CpuBackend)
}

/// Registry with every backend this build provides. Only "cpu" for now.
pub fn default_registry() -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    registry.register(CpuBackend::NAME, cpu);
    registry
}

fn slice_of<T: Element>(buffer: &Buffer) -> Result<&[T]> {
    T::slice_of(buffer).ok_or(TensorError::DtypeMismatch {
        op: "cpu kernel",
        lhs: T::DTYPE,
        rhs: buffer.dtype(),
    })
}

fn slice_of_mut<T: Element>(buffer: &mut Buffer) -> Result<&mut [T]> {
    let dtype = buffer.dtype();
    T::slice_of_mut(buffer).ok_or(TensorError::DtypeMismatch {
        op: "cpu kernel",
        lhs: T::DTYPE,
        rhs: dtype,
    })
}

fn check_len(op: &'static str, a: &NDArray, b: &NDArray) -> Result<()> {
    if a.numel() != b.numel() {
        return Err(TensorError::shape_mismatch(op, a.shape(), b.shape()));
    }
    Ok(())
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    // === Layout ===

    fn compact(&self, a: &NDArray) -> Result<Buffer> {
        with_dtype!(a.dtype(), T => {
            let data = slice_of::<T>(a.buffer())?;
            let out: Vec<T> = ShapeIndices::new(a.shape())
                .map(|idx| data[a.offset() + a.strides().index(&idx)])
                .collect();
            Ok(T::into_buffer(out))
        })
    }

    fn set_strided(
        &self,
        dst: &mut Buffer,
        src: &NDArray,
        shape: &Shape,
        strides: &Strides,
        offset: usize,
    ) -> Result<()> {
        if src.numel() != shape.numel() {
            return Err(TensorError::shape_mismatch("setitem", src.shape(), shape));
        }
        if shape.numel() == 0 {
            return Ok(());
        }
        let last: usize = offset
            + shape
                .dims()
                .iter()
                .zip(strides.as_slice())
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>();
        if last >= dst.len() {
            return Err(TensorError::invalid(format!(
                "strided write reaches element {last} of a {}-element buffer",
                dst.len()
            )));
        }

        with_dtype!(src.dtype(), T => {
            let values = src.as_slice::<T>()?;
            let out = slice_of_mut::<T>(dst)?;
            for (value, idx) in values.iter().zip(ShapeIndices::new(shape)) {
                out[offset + strides.index(&idx)] = *value;
            }
            Ok(())
        })
    }

    // === Creation ===

    fn fill(&self, dtype: DType, len: usize, value: f64) -> Result<Buffer> {
        Ok(Buffer::filled(dtype, len, value))
    }

    // === Element-wise ===

    fn unary(&self, op: UnaryOp, a: &NDArray) -> Result<Buffer> {
        with_dtype!(a.dtype(), T => {
            let out: Vec<T> = a.as_slice::<T>()?.iter().map(|&x| op.apply(x)).collect();
            Ok(T::into_buffer(out))
        })
    }

    fn binary(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<Buffer> {
        check_len("binary", a, b)?;
        with_dtype!(a.dtype(), T => {
            let out: Vec<T> = a
                .as_slice::<T>()?
                .iter()
                .zip(b.as_slice::<T>()?)
                .map(|(&x, &y)| op.apply(x, y))
                .collect();
            Ok(T::into_buffer(out))
        })
    }

    fn binary_assign(&self, op: BinaryOp, dst: &mut Buffer, src: &NDArray) -> Result<()> {
        if dst.len() != src.numel() {
            return Err(TensorError::invalid(format!(
                "in-place {op:?} of {} elements into {}",
                src.numel(),
                dst.len()
            )));
        }
        with_dtype!(src.dtype(), T => {
            let values = src.as_slice::<T>()?;
            for (d, &s) in slice_of_mut::<T>(dst)?.iter_mut().zip(values) {
                *d = op.apply(*d, s);
            }
            Ok(())
        })
    }

    fn scalar(&self, op: BinaryOp, a: &NDArray, value: f64) -> Result<Buffer> {
        with_dtype!(a.dtype(), T => {
            let c = T::from_f64(value);
            let out: Vec<T> = a.as_slice::<T>()?.iter().map(|&x| op.apply(x, c)).collect();
            Ok(T::into_buffer(out))
        })
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, a: &NDArray, reduce_size: usize) -> Result<Buffer> {
        if reduce_size == 0 || a.numel() % reduce_size != 0 {
            return Err(TensorError::invalid(format!(
                "cannot reduce {} elements in blocks of {reduce_size}",
                a.numel()
            )));
        }
        with_dtype!(a.dtype(), T => {
            let out: Vec<T> = a
                .as_slice::<T>()?
                .chunks(reduce_size)
                .map(|block| match op {
                    ReduceOp::Sum => block.iter().fold(T::zero(), |acc, &v| acc + v),
                    ReduceOp::Max => block.iter().fold(T::neg_infinity(), |acc, &v| acc.max_of(v)),
                })
                .collect();
            Ok(T::into_buffer(out))
        })
    }

    // === Linear algebra ===

    fn matmul(&self, a: &NDArray, b: &NDArray, dims: MatmulDims) -> Result<Buffer> {
        let MatmulDims { batch, m, n, p } = dims;
        if a.numel() != batch * m * n || b.numel() != batch * n * p {
            return Err(TensorError::shape_mismatch("matmul", a.shape(), b.shape()));
        }
        let tiled = m % TILE == 0 && n % TILE == 0 && p % TILE == 0;
        trace!("cpu matmul batch={batch} m={m} n={n} p={p} tiled={tiled}");

        with_dtype!(a.dtype(), T => {
            let (lhs, rhs) = (a.as_slice::<T>()?, b.as_slice::<T>()?);
            let mut out = vec![T::zero(); batch * m * p];
            for bi in 0..batch {
                let a_mat = &lhs[bi * m * n..(bi + 1) * m * n];
                let b_mat = &rhs[bi * n * p..(bi + 1) * n * p];
                let o_mat = &mut out[bi * m * p..(bi + 1) * m * p];
                if tiled {
                    matmul_tiled(a_mat, b_mat, o_mat, m, n, p);
                } else {
                    matmul_naive(a_mat, b_mat, o_mat, m, n, p);
                }
            }
            Ok(T::into_buffer(out))
        })
    }

    // === Convolution ===

    fn conv2d(&self, x: &NDArray, w: &NDArray, params: &Conv2dParams) -> Result<Buffer> {
        with_dtype!(x.dtype(), T => {
            let (xs, ws) = (x.as_slice::<T>()?, w.as_slice::<T>()?);
            let mut out = vec![T::zero(); params.output_shape().numel()];
            for_each_tap(params, |xi, wi, oi| out[oi] = out[oi] + xs[xi] * ws[wi]);
            Ok(T::into_buffer(out))
        })
    }

    fn conv2d_input_grad(
        &self,
        out_grad: &NDArray,
        w: &NDArray,
        params: &Conv2dParams,
    ) -> Result<Buffer> {
        // Scattering each output gradient back through the taps that produced
        // it is the full correlation with the flipped kernel.
        with_dtype!(out_grad.dtype(), T => {
            let (gs, ws) = (out_grad.as_slice::<T>()?, w.as_slice::<T>()?);
            let mut dx = vec![T::zero(); params.input_shape().numel()];
            for_each_tap(params, |xi, wi, oi| dx[xi] = dx[xi] + gs[oi] * ws[wi]);
            Ok(T::into_buffer(dx))
        })
    }

    fn conv2d_weight_grad(
        &self,
        x: &NDArray,
        out_grad: &NDArray,
        params: &Conv2dParams,
    ) -> Result<Buffer> {
        with_dtype!(x.dtype(), T => {
            let (xs, gs) = (x.as_slice::<T>()?, out_grad.as_slice::<T>()?);
            let mut dw = vec![T::zero(); params.kernel_shape().numel()];
            for_each_tap(params, |xi, wi, oi| dw[wi] = dw[wi] + xs[xi] * gs[oi]);
            Ok(T::into_buffer(dw))
        })
    }
}

/// Plain triple loop, `out += a @ b` for one `(m, n) @ (n, p)` matrix pair.
fn matmul_naive<T: Element>(a: &[T], b: &[T], out: &mut [T], m: usize, n: usize, p: usize) {
    for i in 0..m {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..p {
                out[i * p + j] = out[i * p + j] + aik * b[k * p + j];
            }
        }
    }
}

/// Same product computed in `TILE x TILE` blocks; every dimension must be a
/// multiple of `TILE`. Each output still sums over `k` in order, so results
/// match `matmul_naive` exactly.
fn matmul_tiled<T: Element>(a: &[T], b: &[T], out: &mut [T], m: usize, n: usize, p: usize) {
    for i0 in (0..m).step_by(TILE) {
        for j0 in (0..p).step_by(TILE) {
            let mut acc = [[T::zero(); TILE]; TILE];
            for k0 in (0..n).step_by(TILE) {
                for (i, row) in acc.iter_mut().enumerate() {
                    for k in 0..TILE {
                        let aik = a[(i0 + i) * n + k0 + k];
                        let b_row = &b[(k0 + k) * p + j0..(k0 + k) * p + j0 + TILE];
                        for (cell, &bkj) in row.iter_mut().zip(b_row) {
                            *cell = *cell + aik * bkj;
                        }
                    }
                }
            }
            for (i, row) in acc.iter().enumerate() {
                out[(i0 + i) * p + j0..(i0 + i) * p + j0 + TILE].copy_from_slice(row);
            }
        }
    }
}

/// Visit every (input, kernel, output) flat index triple that contributes to
/// a grouped convolution. Padding taps are skipped.
fn for_each_tap<F>(p: &Conv2dParams, mut visit: F)
where
    F: FnMut(usize, usize, usize),
{
    let (oh, ow) = (p.out_height(), p.out_width());
    let k = p.kernel_size;
    let cin_g = p.in_channels / p.groups;
    let cout_g = p.out_channels / p.groups;

    for nb in 0..p.batch {
        for oc in 0..p.out_channels {
            let group = oc / cout_g;
            for oy in 0..oh {
                for ox in 0..ow {
                    let oi = ((nb * p.out_channels + oc) * oh + oy) * ow + ox;
                    for ic in 0..cin_g {
                        let c = group * cin_g + ic;
                        for ky in 0..k {
                            let iy = oy * p.stride + ky;
                            if iy < p.padding || iy - p.padding >= p.height {
                                continue;
                            }
                            let iy = iy - p.padding;
                            for kx in 0..k {
                                let ix = ox * p.stride + kx;
                                if ix < p.padding || ix - p.padding >= p.width {
                                    continue;
                                }
                                let ix = ix - p.padding;
                                let xi = ((nb * p.in_channels + c) * p.height + iy) * p.width + ix;
                                let wi = ((oc * cin_g + ic) * k + ky) * k + kx;
                                visit(xi, wi, oi);
                            }
                        }
                    }
                }
            }
        }
    }
}
