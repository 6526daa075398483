//! Backend dispatch through the graph: memoized realization, error
//! taxonomy, device registry and grouped convolution isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use needle_backend_cpu::{cpu, default_registry, CpuBackend};
use needle_tensor::backend::{Backend, BinaryOp, MatmulDims, ReduceOp, UnaryOp};
use needle_tensor::prelude::*;
use needle_tensor::{Buffer, Strides};

fn config() -> Config {
    Config::new(cpu()).with_dtype(DType::Float64)
}

/// CPU kernels behind a different name, counting element-wise launches.
#[derive(Debug)]
struct CountingBackend {
    name: &'static str,
    binary_calls: Arc<AtomicUsize>,
}

impl CountingBackend {
    fn named(name: &'static str) -> Self {
        CountingBackend {
            name,
            binary_calls: Arc::default(),
        }
    }
}

impl Backend for CountingBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn compact(&self, a: &NDArray) -> Result<Buffer> {
        CpuBackend.compact(a)
    }

    fn set_strided(
        &self,
        dst: &mut Buffer,
        src: &NDArray,
        shape: &Shape,
        strides: &Strides,
        offset: usize,
    ) -> Result<()> {
        CpuBackend.set_strided(dst, src, shape, strides, offset)
    }

    fn fill(&self, dtype: DType, len: usize, value: f64) -> Result<Buffer> {
        CpuBackend.fill(dtype, len, value)
    }

    fn unary(&self, op: UnaryOp, a: &NDArray) -> Result<Buffer> {
        CpuBackend.unary(op, a)
    }

    fn binary(&self, op: BinaryOp, a: &NDArray, b: &NDArray) -> Result<Buffer> {
        self.binary_calls.fetch_add(1, Ordering::SeqCst);
        CpuBackend.binary(op, a, b)
    }

    fn scalar(&self, op: BinaryOp, a: &NDArray, value: f64) -> Result<Buffer> {
        CpuBackend.scalar(op, a, value)
    }

    fn reduce(&self, op: ReduceOp, a: &NDArray, reduce_size: usize) -> Result<Buffer> {
        CpuBackend.reduce(op, a, reduce_size)
    }

    fn matmul(&self, a: &NDArray, b: &NDArray, dims: MatmulDims) -> Result<Buffer> {
        CpuBackend.matmul(a, b, dims)
    }
}

/// Implements storage primitives only; every compute kernel is missing.
#[derive(Debug)]
struct StorageOnly;

impl Backend for StorageOnly {
    fn name(&self) -> &str {
        "storage-only"
    }

    fn compact(&self, a: &NDArray) -> Result<Buffer> {
        CpuBackend.compact(a)
    }

    fn fill(&self, dtype: DType, len: usize, value: f64) -> Result<Buffer> {
        CpuBackend.fill(dtype, len, value)
    }
}

#[test]
fn test_realization_is_memoized() -> Result<()> {
    let backend = CountingBackend::named("counting");
    let calls = Arc::clone(&backend.binary_calls);
    let config = Config::new(Device::new(backend)).with_dtype(DType::Float64);

    let x = Tensor::constant(&[1.0, 2.0, 3.0], [3], &config)?;
    let y = x.mul(&x)?;
    let z = y.add(&y)?;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(z.to_vec()?, vec![2.0, 8.0, 18.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Neither re-reading z nor reading its already-realized input recomputes.
    z.realize()?;
    assert_eq!(y.to_vec()?, vec![1.0, 4.0, 9.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A new consumer computes only itself.
    let w = y.sub(&x)?;
    assert_eq!(w.to_vec()?, vec![0.0, 2.0, 6.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn test_eager_mode_realizes_at_construction() -> Result<()> {
    let backend = CountingBackend::named("counting-eager");
    let calls = Arc::clone(&backend.binary_calls);
    let config = Config::new(Device::new(backend))
        .with_dtype(DType::Float64)
        .with_mode(ExecutionMode::Eager);

    let x = Tensor::constant(&[1.0, 2.0], [2], &config)?;
    let y = x.add(&x)?;
    assert!(y.is_realized());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(y.to_vec()?, vec![2.0, 4.0]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_shape_mismatch() -> Result<()> {
    let a = Tensor::constant(&[1.0, 2.0, 3.0], [3], &config())?;
    let b = Tensor::constant(&[1.0, 2.0, 3.0, 4.0], [4], &config())?;
    assert!(matches!(
        a.add(&b),
        Err(TensorError::ShapeMismatch { op: "add", .. })
    ));

    let m = Tensor::zeros([2, 3], &config())?;
    let n = Tensor::zeros([4, 2], &config())?;
    assert!(matches!(
        m.matmul(&n),
        Err(TensorError::ShapeMismatch { op: "matmul", .. })
    ));

    assert!(matches!(
        a.reshape([2, 2]),
        Err(TensorError::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_dtype_mismatch() -> Result<()> {
    let single = Tensor::constant(&[1.0], [1], &Config::new(cpu()))?;
    let double = Tensor::constant(&[1.0], [1], &config())?;
    assert!(matches!(
        single.mul(&double),
        Err(TensorError::DtypeMismatch {
            lhs: DType::Float32,
            rhs: DType::Float64,
            ..
        })
    ));

    // Typed construction refuses to coerce.
    assert!(matches!(
        Tensor::from_vec(vec![1.0f32, 2.0], [2], false, &config()),
        Err(TensorError::DtypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_device_mismatch_and_explicit_transfer() -> Result<()> {
    let other = Device::new(CountingBackend::named("other"));
    let a = Tensor::constant(&[1.0, 2.0], [2], &config())?;
    let other_config = Config::new(other).with_dtype(DType::Float64);
    let b = Tensor::constant(&[3.0, 4.0], [2], &other_config)?;

    match a.add(&b) {
        Err(TensorError::DeviceMismatch { lhs, rhs, .. }) => {
            assert_eq!(lhs, "cpu");
            assert_eq!(rhs, "other");
        }
        other => panic!("expected DeviceMismatch, got {other:?}"),
    }

    let moved = b.to_device(&cpu())?;
    assert_eq!(moved.device(), &cpu());
    assert_eq!(a.add(&moved)?.to_vec()?, vec![4.0, 6.0]);
    Ok(())
}

#[test]
fn test_to_device_keeps_requires_grad() -> Result<()> {
    let other = Device::new(CountingBackend::named("other"));
    let x = Tensor::var(&[1.0, 2.0], [2], &config())?;
    let derived = x.mul_scalar(3.0)?;

    for target in [cpu(), other] {
        let copy = derived.to_device(&target)?;
        assert!(copy.is_leaf());
        assert!(copy.requires_grad(), "copy to {} dropped requires_grad", target.name());
        assert_eq!(copy.to_vec()?, vec![3.0, 6.0]);
    }

    // The copy is a new leaf: gradients stop at it.
    let copy = derived.to_device(&cpu())?;
    copy.sum(None, false)?.backward()?;
    assert_eq!(copy.grad()?.to_vec()?, vec![1.0, 1.0]);
    assert!(!x.has_grad());

    let constant = Tensor::constant(&[1.0], [1], &config())?;
    assert!(!constant.to_device(&cpu())?.requires_grad());
    Ok(())
}

#[test]
fn test_gradient_unavailable() -> Result<()> {
    let x = Tensor::var(&[1.0], [1], &config())?;
    assert!(matches!(
        x.grad(),
        Err(TensorError::GradientUnavailable { node }) if node == x.id().as_u64()
    ));

    // Backward from a graph with nothing to differentiate fails loudly.
    let c = Tensor::constant(&[1.0], [1], &config())?;
    assert!(matches!(
        c.exp()?.backward(),
        Err(TensorError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn test_missing_kernel_is_unsupported() -> Result<()> {
    let config = Config::new(Device::new(StorageOnly)).with_dtype(DType::Float64);
    let x = Tensor::constant(&[1.0, 2.0], [2], &config)?;

    // Building the node succeeds; the missing kernel surfaces on realization.
    let y = x.exp()?;
    let err = y.realize().unwrap_err();
    assert!(matches!(err, TensorError::Realization { op: "exp", .. }));
    match err.root_cause() {
        TensorError::UnsupportedOperation { backend, primitive } => {
            assert_eq!(backend, "storage-only");
            assert_eq!(*primitive, "unary");
        }
        other => panic!("expected UnsupportedOperation, got {other:?}"),
    }

    // Pure layout ops still work.
    assert_eq!(x.reshape([1, 2])?.to_vec()?, vec![1.0, 2.0]);

    // Composites are lazy too: the reduction inside softmax fails on read.
    let probs = x.reshape([1, 2])?.softmax(1)?;
    let err = probs.realize().unwrap_err();
    assert!(matches!(
        err.root_cause(),
        TensorError::UnsupportedOperation { primitive: "reduce", .. }
    ));
    Ok(())
}

#[test]
fn test_invalid_axis() -> Result<()> {
    let x = Tensor::zeros([2, 3], &config())?;
    assert!(matches!(
        x.sum(Some(&[2]), false),
        Err(TensorError::InvalidAxis { axis: 2, ndim: 2 })
    ));
    Ok(())
}

#[test]
fn test_registry() -> Result<()> {
    let registry = default_registry();
    assert!(registry.is_available("cpu"));
    assert!(!registry.is_available("cuda"));
    assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["cpu"]);

    let device = registry.get("cpu")?;
    assert!(device.is_enabled());
    assert_eq!(device.name(), "cpu");

    assert!(matches!(
        registry.get("cuda"),
        Err(TensorError::UnknownDevice(tag)) if tag == "cuda"
    ));
    Ok(())
}

#[test]
fn test_grouped_conv_isolates_groups() -> Result<()> {
    let config = config();
    let values: Vec<f64> = (0..36).map(|v| (v as f64 * 0.37).sin()).collect();
    let w = Tensor::constant(
        &(0..36).map(|v| (v as f64 * 0.11).cos()).collect::<Vec<_>>(),
        [4, 2, 3, 3],
        &config,
    )?;

    let x = Tensor::constant(&values, [1, 4, 3, 3], &config)?;
    // Perturb input channels 2..4, which belong to group 1.
    let mut perturbed = values.clone();
    for v in &mut perturbed[18..] {
        *v += 10.0;
    }
    let x2 = Tensor::constant(&perturbed, [1, 4, 3, 3], &config)?;

    let y = x.conv2d(&w, 1, 1, 2)?.to_vec()?;
    let y2 = x2.conv2d(&w, 1, 1, 2)?.to_vec()?;
    // Output channels 0..2 (group 0) are unchanged, group 1 moves.
    assert_eq!(y[..18], y2[..18]);
    assert_ne!(y[18..], y2[18..]);

    // Gradient of group 0 outputs never reaches group 1 inputs.
    let xv = Tensor::var(&values, [1, 4, 3, 3], &config)?;
    let group0 = xv.conv2d(&w, 1, 1, 2)?.slice(&[
        SliceRange::full(1),
        SliceRange::new(0, 2, 1),
        SliceRange::full(3),
        SliceRange::full(3),
    ])?;
    group0.sum(None, false)?.backward()?;
    let dx = xv.grad()?.to_vec()?;
    assert!(dx[18..].iter().all(|&g| g == 0.0));
    assert!(dx[..18].iter().any(|&g| g != 0.0));
    Ok(())
}
