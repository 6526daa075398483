//! Reverse-mode automatic differentiation for tensors.
//!
//! Each pass starts from fresh adjoints. When it finishes, every node it
//! reached that requires grad has its gradient slot replaced with the pass's
//! total, so repeated passes never stack on top of each other. Use
//! [`Tensor::zero_grad`] to clear a slot explicitly.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::backend::{BinaryOp, Conv2dParams, UnaryOp};
use crate::error::{Result, TensorError};
use crate::node::{NodeId, Tensor};
use crate::op::TensorOp;
use crate::shape::Shape;
use crate::storage::{NDArray, SliceRange};

/// Container for gradient arrays computed during backward pass.
#[derive(Debug, Default)]
pub struct Gradients {
    /// Map from node ID to gradient.
    adjoints: HashMap<NodeId, NDArray>,
}

impl Gradients {
    /// Get gradient with respect to a tensor expression.
    pub fn wrt(&self, expr: &Tensor) -> Option<&NDArray> {
        self.adjoints.get(&expr.id())
    }

    pub fn len(&self) -> usize {
        self.adjoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjoints.is_empty()
    }
}

impl Tensor {
    /// Differentiate from this node with an all-ones output gradient.
    pub fn backward(&self) -> Result<Gradients> {
        backward(self)
    }

    /// Differentiate from this node with a caller-supplied output gradient.
    pub fn backward_with(&self, out_grad: &Tensor) -> Result<Gradients> {
        backward_with(self, out_grad.realize()?.clone())
    }
}

/// Compute gradients via reverse-mode autodiff.
pub fn backward(output: &Tensor) -> Result<Gradients> {
    let seed = NDArray::ones(output.shape().clone(), output.dtype(), output.device())?;
    backward_with(output, seed)
}

/// Compute gradients starting from `seed` as the output's adjoint.
pub fn backward_with(output: &Tensor, seed: NDArray) -> Result<Gradients> {
    if !output.requires_grad() {
        return Err(TensorError::invalid(format!(
            "backward from node {} which does not require grad",
            output.id().as_u64()
        )));
    }
    if seed.shape() != output.shape() {
        return Err(TensorError::shape_mismatch(
            "backward",
            output.shape(),
            seed.shape(),
        ));
    }
    if seed.dtype() != output.dtype() {
        return Err(TensorError::DtypeMismatch {
            op: "backward",
            lhs: output.dtype(),
            rhs: seed.dtype(),
        });
    }

    // Forward values are needed by most gradient rules.
    output.realize()?;

    // Step 1: Topological sort
    let topo_order = topological_sort(output);

    // Step 2: Initialize adjoints
    let mut adjoints: HashMap<NodeId, NDArray> = HashMap::new();
    adjoints.insert(output.id(), seed);

    // Step 3: Reverse traversal
    for expr in topo_order.iter().rev() {
        if expr.is_leaf() {
            continue;
        }
        let Some(node_adjoint) = adjoints.get(&expr.id()).cloned() else {
            continue;
        };

        let input_grads = compute_local_gradients(expr, &node_adjoint)?;
        trace!(
            "gradient rule {} at node {}",
            expr.op().name(),
            expr.id().as_u64()
        );

        for (input, grad) in expr.inputs().iter().zip(input_grads) {
            let Some(grad) = grad else {
                continue;
            };
            debug_assert_eq!(grad.shape(), input.shape());
            match adjoints.entry(input.id()) {
                Entry::Occupied(mut slot) => slot.get_mut().try_add_assign(&grad)?,
                Entry::Vacant(slot) => {
                    slot.insert(grad);
                }
            }
        }
    }

    // Step 4: Replace the gradient slots of every node this pass reached
    for expr in &topo_order {
        if let Some(grad) = adjoints.get(&expr.id()) {
            expr.set_grad(grad.clone());
        }
    }

    debug!(
        "backward from node {}: {} nodes visited, {} gradients",
        output.id().as_u64(),
        topo_order.len(),
        adjoints.len()
    );
    Ok(Gradients { adjoints })
}

/// Run `f` only when the input needs a gradient.
fn when<F>(needed: bool, f: F) -> Result<Option<NDArray>>
where
    F: FnOnce() -> Result<NDArray>,
{
    if needed {
        f().map(Some)
    } else {
        Ok(None)
    }
}

/// Compute local gradients for each input of a node.
/// Returns one `Option<gradient>` per input, already un-broadcast to the
/// input's shape.
fn compute_local_gradients(expr: &Tensor, upstream: &NDArray) -> Result<Vec<Option<NDArray>>> {
    let inputs = expr.inputs();
    let want = |i: usize| inputs[i].requires_grad();
    let out = expr.realize()?;
    let g = upstream;

    let grads = match expr.op() {
        TensorOp::Leaf => vec![],

        // === Unary element-wise ===
        TensorOp::Neg => vec![when(want(0), || g.neg())?],

        TensorOp::Exp => {
            // d(exp(x))/dx = exp(x) = output
            vec![when(want(0), || g.mul(out))?]
        }

        TensorOp::Log => {
            // d(ln(x))/dx = 1/x
            let x = inputs[0].realize()?;
            vec![when(want(0), || g.div(x))?]
        }

        TensorOp::Tanh => {
            // d(tanh(x))/dx = 1 - tanh(x)^2
            vec![when(want(0), || {
                let local = out
                    .mul(out)?
                    .scalar(BinaryOp::Mul, -1.0)?
                    .scalar(BinaryOp::Add, 1.0)?;
                g.mul(&local)
            })?]
        }

        TensorOp::Relu => {
            // d(relu(x))/dx = 1 if x > 0 else 0
            let x = inputs[0].realize()?;
            vec![when(want(0), || g.mul(&x.scalar(BinaryOp::Gt, 0.0)?))?]
        }

        TensorOp::Sqrt => {
            // d(sqrt(x))/dx = 0.5 / sqrt(x)
            vec![when(want(0), || g.div(out)?.scalar(BinaryOp::Mul, 0.5))?]
        }

        TensorOp::Sigmoid => {
            // d(sigmoid(x))/dx = s * (1 - s)
            vec![when(want(0), || {
                let one_minus = out.scalar(BinaryOp::Mul, -1.0)?.scalar(BinaryOp::Add, 1.0)?;
                g.mul(&out.mul(&one_minus)?)
            })?]
        }

        // === Binary element-wise with broadcasting ===
        TensorOp::Add => {
            let (a, b) = (inputs[0].shape(), inputs[1].shape());
            vec![
                when(want(0), || g.sum_to(a))?,
                when(want(1), || g.sum_to(b))?,
            ]
        }

        TensorOp::Sub => {
            let (a, b) = (inputs[0].shape(), inputs[1].shape());
            vec![
                when(want(0), || g.sum_to(a))?,
                when(want(1), || g.neg()?.sum_to(b))?,
            ]
        }

        TensorOp::Mul => {
            // d(a*b)/da = b, d(a*b)/db = a
            let (a, b) = (inputs[0].realize()?, inputs[1].realize()?);
            vec![
                when(want(0), || g.mul(b)?.sum_to(a.shape()))?,
                when(want(1), || g.mul(a)?.sum_to(b.shape()))?,
            ]
        }

        TensorOp::Div => {
            // d(a/b)/da = 1/b, d(a/b)/db = -a/b^2
            let (a, b) = (inputs[0].realize()?, inputs[1].realize()?);
            vec![
                when(want(0), || g.div(b)?.sum_to(a.shape()))?,
                when(want(1), || {
                    g.mul(a)?.div(&b.mul(b)?)?.neg()?.sum_to(b.shape())
                })?,
            ]
        }

        TensorOp::Pow => {
            // d(a^b)/da = b * a^(b-1), d(a^b)/db = a^b * ln(a)
            let (a, b) = (inputs[0].realize()?, inputs[1].realize()?);
            vec![
                when(want(0), || {
                    let a_pow = a.binary(BinaryOp::Pow, &b.scalar(BinaryOp::Add, -1.0)?)?;
                    g.mul(&a_pow.mul(b)?)?.sum_to(a.shape())
                })?,
                when(want(1), || {
                    g.mul(&out.mul(&a.unary(UnaryOp::Log)?)?)?.sum_to(b.shape())
                })?,
            ]
        }

        TensorOp::Maximum => {
            // d(max(a,b))/da = 1 if a >= b, d(max(a,b))/db = 1 if b > a
            let (a, b) = (inputs[0].realize()?, inputs[1].realize()?);
            vec![
                when(want(0), || g.mul(&a.binary(BinaryOp::Ge, b)?)?.sum_to(a.shape()))?,
                when(want(1), || g.mul(&b.binary(BinaryOp::Gt, a)?)?.sum_to(b.shape()))?,
            ]
        }

        // === Scalar right-hand side ===
        TensorOp::AddScalar(_) => vec![when(want(0), || Ok(g.clone()))?],

        TensorOp::MulScalar(c) => vec![when(want(0), || g.scalar(BinaryOp::Mul, *c))?],

        TensorOp::DivScalar(c) => vec![when(want(0), || g.scalar(BinaryOp::Div, *c))?],

        TensorOp::PowScalar(p) => {
            // d(x^p)/dx = p * x^(p-1)
            let x = inputs[0].realize()?;
            vec![when(want(0), || {
                let local = x
                    .scalar(BinaryOp::Pow, p - 1.0)?
                    .scalar(BinaryOp::Mul, *p)?;
                g.mul(&local)
            })?]
        }

        // === Reductions ===
        TensorOp::Sum { axes, keepdims } => {
            let shape = inputs[0].shape();
            vec![when(want(0), || {
                expand_reduced(g, shape, axes.as_deref(), *keepdims)
            })?]
        }

        TensorOp::Mean { axes, keepdims } => {
            let shape = inputs[0].shape();
            vec![when(want(0), || {
                let resolved = shape.resolve_axes(axes.as_deref())?;
                let count: usize = resolved.iter().map(|&ax| shape.dim(ax)).product();
                expand_reduced(g, shape, axes.as_deref(), *keepdims)?
                    .scalar(BinaryOp::Div, count as f64)
            })?]
        }

        TensorOp::Max { axes, keepdims } => {
            // Gradient only flows to the max element(s); ties each get it.
            let x = inputs[0].realize()?;
            vec![when(want(0), || {
                let expanded_grad = expand_reduced(g, x.shape(), axes.as_deref(), *keepdims)?;
                let expanded_out = expand_reduced(out, x.shape(), axes.as_deref(), *keepdims)?;
                expanded_grad.mul(&x.binary(BinaryOp::Eq, &expanded_out)?)
            })?]
        }

        // === Linear algebra ===
        TensorOp::MatMul => {
            // C = A @ B
            // dL/dA = dL/dC @ B^T, dL/dB = A^T @ dL/dC, then drop broadcast batch axes
            let (a, b) = (inputs[0].realize()?, inputs[1].realize()?);
            vec![
                when(want(0), || g.matmul(&b.swap_last_axes()?)?.sum_to(a.shape()))?,
                when(want(1), || a.swap_last_axes()?.matmul(g)?.sum_to(b.shape()))?,
            ]
        }

        // === Shape operations ===
        TensorOp::Permute { axes } => {
            // Inverse permutation
            let mut inverse = vec![0; axes.len()];
            for (i, &ax) in axes.iter().enumerate() {
                inverse[ax] = i;
            }
            vec![when(want(0), || g.permute(&inverse))?]
        }

        TensorOp::Reshape { .. } => {
            let shape = inputs[0].shape();
            vec![when(want(0), || g.reshape(shape.clone()))?]
        }

        TensorOp::BroadcastTo { .. } => {
            let shape = inputs[0].shape();
            vec![when(want(0), || g.sum_to(shape))?]
        }

        TensorOp::Slice { ranges } => {
            let shape = inputs[0].shape();
            vec![when(want(0), || g.full_like(shape.clone(), 0.0)?.set_slice(ranges, g))?]
        }

        TensorOp::Select { axis, index } => {
            // Scatter back into a zero tensor at the selected index.
            let shape = inputs[0].shape();
            vec![when(want(0), || {
                let ranges: Vec<SliceRange> = (0..shape.ndim())
                    .map(|ax| {
                        if ax == *axis {
                            SliceRange::at(*index)
                        } else {
                            SliceRange::full(shape.dim(ax))
                        }
                    })
                    .collect();
                let kept = g.reshape(shape.with_ones_at(&[*axis]))?;
                g.full_like(shape.clone(), 0.0)?.set_slice(&ranges, &kept)
            })?]
        }

        TensorOp::Stack { axis } => (0..inputs.len())
            .map(|i| when(want(i), || g.select(*axis, i)))
            .collect::<Result<Vec<_>>>()?,

        // === Convolution ===
        TensorOp::Conv2d {
            stride,
            padding,
            groups,
        } => {
            let (x, w) = (inputs[0].realize()?, inputs[1].realize()?);
            let params = Conv2dParams::new(x.shape(), w.shape(), *stride, *padding, *groups)?;
            vec![
                when(want(0), || g.conv2d_input_grad(w, &params))?,
                when(want(1), || x.conv2d_weight_grad(g, &params))?,
            ]
        }

        // Never requires grad, so a pass only gets here if that changes.
        TensorOp::StopGradient => vec![None],
    };

    Ok(grads)
}

/// Broadcast a reduction's gradient back up to the pre-reduction shape.
fn expand_reduced(
    grad: &NDArray,
    input_shape: &Shape,
    axes: Option<&[usize]>,
    keepdims: bool,
) -> Result<NDArray> {
    let axes = input_shape.resolve_axes(axes)?;
    let kept = if keepdims {
        grad.clone()
    } else {
        grad.reshape(input_shape.with_ones_at(&axes))?
    };
    kept.broadcast_to(input_shape.clone())
}

/// Topological sort via iterative DFS postorder, restricted to nodes that
/// require grad.
fn topological_sort(root: &Tensor) -> Vec<Tensor> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];

    while let Some((expr, expanded)) = stack.pop() {
        if expanded {
            order.push(expr);
            continue;
        }
        if !visited.insert(expr.id()) {
            continue;
        }
        stack.push((expr.clone(), true));
        for input in expr.inputs().iter().rev() {
            if input.requires_grad() && !visited.contains(&input.id()) {
                stack.push((input.clone(), false));
            }
        }
    }

    order
}
