//! Computation graph nodes for tensor autodiff.
//!
//! A [`Tensor`] is a reference-counted node: the op that produced it, its
//! inputs, the metadata inferred at build time, a write-once value cell and a
//! gradient slot. Values are computed on demand and cached, so a node's
//! forward compute runs at most once.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use log::{debug, trace};
use rand::Rng;

use crate::device::{Config, Device, ExecutionMode};
use crate::dtype::{DType, Element};
use crate::error::{Result, TensorError};
use crate::op::TensorOp;
use crate::shape::Shape;
use crate::storage::NDArray;

/// Global counter for unique node IDs.
static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> u64 {
    NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Internal node structure.
pub struct TensorNode {
    id: NodeId,
    op: TensorOp,
    inputs: Vec<Tensor>,
    shape: Shape,
    dtype: DType,
    device: Device,
    mode: ExecutionMode,
    requires_grad: bool,
    value: OnceLock<NDArray>,
    grad: Mutex<Option<NDArray>>,
}

// Dropping the last handle to a long chain would otherwise recurse once per
// node. Inputs are unlinked onto a heap stack instead.
impl Drop for TensorNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.inputs);
        while let Some(Tensor(node)) = stack.pop() {
            if let Ok(mut node) = Arc::try_unwrap(node) {
                stack.append(&mut node.inputs);
            }
        }
    }
}

/// A tensor expression in the computation graph.
/// Reference-counted for efficient sharing.
#[derive(Clone)]
pub struct Tensor(pub(crate) Arc<TensorNode>);

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.0.id)
            .field("op", &self.0.op)
            .field("shape", &self.0.shape)
            .field("dtype", &self.0.dtype)
            .field("device", &self.0.device.name())
            .field("requires_grad", &self.0.requires_grad)
            .field("realized", &self.is_realized())
            .finish()
    }
}

impl Tensor {
    // === Constructors ===

    /// Leaf node around an already-computed value.
    pub fn from_ndarray(value: NDArray, requires_grad: bool, mode: ExecutionMode) -> Self {
        let (shape, dtype, device) = (value.shape().clone(), value.dtype(), value.device().clone());
        Tensor(Arc::new(TensorNode {
            id: NodeId(next_node_id()),
            op: TensorOp::Leaf,
            inputs: Vec::new(),
            shape,
            dtype,
            device,
            mode,
            requires_grad,
            value: OnceLock::from(value),
            grad: Mutex::new(None),
        }))
    }

    /// Leaf from f64 values, stored with `config.dtype` on `config.device`.
    pub fn from_f64(
        values: &[f64],
        shape: impl Into<Shape>,
        requires_grad: bool,
        config: &Config,
    ) -> Result<Self> {
        let value = NDArray::from_f64(values, shape, config.dtype, &config.device)?;
        Ok(Self::from_ndarray(value, requires_grad, config.mode))
    }

    /// Leaf from typed data; `T` must match `config.dtype`.
    pub fn from_vec<T: Element>(
        data: Vec<T>,
        shape: impl Into<Shape>,
        requires_grad: bool,
        config: &Config,
    ) -> Result<Self> {
        if T::DTYPE != config.dtype {
            return Err(TensorError::DtypeMismatch {
                op: "from_vec",
                lhs: config.dtype,
                rhs: T::DTYPE,
            });
        }
        let value = NDArray::from_vec(data, shape, &config.device)?;
        Ok(Self::from_ndarray(value, requires_grad, config.mode))
    }

    /// Create a variable tensor (tracked for gradients).
    pub fn var(values: &[f64], shape: impl Into<Shape>, config: &Config) -> Result<Self> {
        Self::from_f64(values, shape, true, config)
    }

    /// Create a constant tensor (not tracked for gradients).
    pub fn constant(values: &[f64], shape: impl Into<Shape>, config: &Config) -> Result<Self> {
        Self::from_f64(values, shape, false, config)
    }

    pub fn full(
        shape: impl Into<Shape>,
        value: f64,
        requires_grad: bool,
        config: &Config,
    ) -> Result<Self> {
        let value = NDArray::full(shape, value, config.dtype, &config.device)?;
        Ok(Self::from_ndarray(value, requires_grad, config.mode))
    }

    /// Create a zeros tensor.
    pub fn zeros(shape: impl Into<Shape>, config: &Config) -> Result<Self> {
        Self::full(shape, 0.0, false, config)
    }

    /// Create a ones tensor.
    pub fn ones(shape: impl Into<Shape>, config: &Config) -> Result<Self> {
        Self::full(shape, 1.0, false, config)
    }

    /// Create a scalar tensor.
    pub fn scalar(value: f64, config: &Config) -> Result<Self> {
        Self::full(Shape::scalar(), value, false, config)
    }

    /// Values drawn uniformly from `[low, high)`.
    pub fn rand_uniform<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        requires_grad: bool,
        rng: &mut R,
        config: &Config,
    ) -> Result<Self> {
        let shape = shape.into();
        let values: Vec<f64> = (0..shape.numel())
            .map(|_| low + (high - low) * rng.gen::<f64>())
            .collect();
        Self::from_f64(&values, shape, requires_grad, config)
    }

    /// Normally distributed values (Box-Muller).
    pub fn randn<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        mean: f64,
        std: f64,
        requires_grad: bool,
        rng: &mut R,
        config: &Config,
    ) -> Result<Self> {
        let shape = shape.into();
        let values: Vec<f64> = (0..shape.numel())
            .map(|_| {
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen();
                mean + std * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
            })
            .collect();
        Self::from_f64(&values, shape, requires_grad, config)
    }

    /// Build a derived node. Dtype, device and shape are checked here, so a
    /// malformed graph is rejected before anything is computed.
    pub(crate) fn from_op(op: TensorOp, inputs: Vec<Tensor>) -> Result<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| TensorError::invalid(format!("{} needs inputs", op.name())))?;
        for other in &inputs[1..] {
            if other.dtype() != first.dtype() {
                return Err(TensorError::DtypeMismatch {
                    op: op.name(),
                    lhs: first.dtype(),
                    rhs: other.dtype(),
                });
            }
            if other.device() != first.device() {
                return Err(TensorError::DeviceMismatch {
                    op: op.name(),
                    lhs: first.device().name().to_string(),
                    rhs: other.device().name().to_string(),
                });
            }
        }

        let shapes: Vec<&Shape> = inputs.iter().map(Tensor::shape).collect();
        let shape = op.output_shape(&shapes)?;
        let requires_grad =
            op != TensorOp::StopGradient && inputs.iter().any(Tensor::requires_grad);
        let (dtype, device, mode) = (first.dtype(), first.device().clone(), first.mode());

        let tensor = Tensor(Arc::new(TensorNode {
            id: NodeId(next_node_id()),
            op,
            inputs,
            shape,
            dtype,
            device,
            mode,
            requires_grad,
            value: OnceLock::new(),
            grad: Mutex::new(None),
        }));
        if mode == ExecutionMode::Eager {
            tensor.realize()?;
        }
        Ok(tensor)
    }

    // === Accessors ===

    /// Get unique node ID.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// Get the operation.
    pub fn op(&self) -> &TensorOp {
        &self.0.op
    }

    /// Get input tensors.
    pub fn inputs(&self) -> &[Tensor] {
        &self.0.inputs
    }

    pub fn shape(&self) -> &Shape {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn device(&self) -> &Device {
        &self.0.device
    }

    pub fn mode(&self) -> ExecutionMode {
        self.0.mode
    }

    pub fn ndim(&self) -> usize {
        self.0.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.0.shape.numel()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.0.op, TensorOp::Leaf)
    }

    pub fn is_realized(&self) -> bool {
        self.0.value.get().is_some()
    }

    /// Same node (not just equal values).
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // === Realization ===

    /// Materialized value. Unrealized ancestors are computed first, each
    /// exactly once, and cached in their nodes.
    pub fn realize(&self) -> Result<&NDArray> {
        if let Some(value) = self.0.value.get() {
            return Ok(value);
        }

        let pending = self.unrealized_post_order();
        debug!(
            "realizing node {} ({}): {} pending nodes",
            self.0.id.0,
            self.0.op.name(),
            pending.len()
        );

        for node in &pending {
            let inputs = node
                .inputs()
                .iter()
                .map(Tensor::realized_value)
                .collect::<Result<Vec<_>>>()?;
            let value = node
                .op()
                .compute(&inputs)
                .map_err(|source| TensorError::Realization {
                    op: node.op().name(),
                    source: Box::new(source),
                })?;
            debug_assert_eq!(value.shape(), node.shape());
            trace!("computed node {} ({}) {}", node.0.id.0, node.op().name(), node.shape());
            let _ = node.0.value.set(value);
        }

        self.realized_value()
    }

    fn realized_value(&self) -> Result<&NDArray> {
        self.0.value.get().ok_or_else(|| {
            TensorError::invalid(format!("node {} has not been realized", self.0.id.0))
        })
    }

    /// Unrealized ancestors (self included) in post-order; realized nodes
    /// act as leaves.
    fn unrealized_post_order(&self) -> Vec<Tensor> {
        let mut order = Vec::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<(Tensor, bool)> = vec![(self.clone(), false)];

        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(node);
                continue;
            }
            if node.is_realized() || !visited.insert(node.id()) {
                continue;
            }
            stack.push((node.clone(), true));
            for input in node.inputs().iter().rev() {
                if !input.is_realized() && !visited.contains(&input.id()) {
                    stack.push((input.clone(), false));
                }
            }
        }

        order
    }

    /// Values in row-major order as f64.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.realize()?.to_vec_f64()
    }

    /// Get scalar value.
    pub fn item(&self) -> Result<f64> {
        self.realize()?.item()
    }

    /// Same value, no provenance: gradients stop here.
    pub fn detach(&self) -> Result<Tensor> {
        let value = self.realize()?.clone();
        Ok(Tensor::from_ndarray(value, false, self.0.mode))
    }

    /// Explicit copy to `device` as a new leaf. The leaf keeps this
    /// tensor's `requires_grad` flag, on the same device or another one; the
    /// copy has no provenance, so gradients never flow back across it.
    pub fn to_device(&self, device: &Device) -> Result<Tensor> {
        let value = if device == self.device() {
            self.realize()?.clone()
        } else {
            let values = self.to_vec()?;
            NDArray::from_f64(&values, self.shape().clone(), self.dtype(), device)?
        };
        Ok(Tensor::from_ndarray(value, self.requires_grad(), self.0.mode))
    }

    // === Gradient slot ===

    fn grad_slot(&self) -> MutexGuard<'_, Option<NDArray>> {
        self.0.grad.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gradient from the most recent backward pass that reached this node,
    /// as a constant leaf.
    pub fn grad(&self) -> Result<Tensor> {
        self.grad_array()
            .map(|g| Tensor::from_ndarray(g, false, self.0.mode))
            .ok_or(TensorError::GradientUnavailable { node: self.0.id.0 })
    }

    pub fn grad_array(&self) -> Option<NDArray> {
        self.grad_slot().clone()
    }

    pub fn has_grad(&self) -> bool {
        self.grad_slot().is_some()
    }

    /// Drop the stored gradient.
    pub fn zero_grad(&self) {
        *self.grad_slot() = None;
    }

    pub(crate) fn set_grad(&self, grad: NDArray) {
        *self.grad_slot() = Some(grad);
    }
}
