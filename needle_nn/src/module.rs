//! Trainable parameters and the `Module` trait.

use std::sync::atomic::{AtomicU64, Ordering};

use needle_tensor::prelude::*;

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a parameter slot. Stays fixed when an optimizer swaps in
/// new values, so per-parameter optimizer state survives the swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(u64);

/// A trainable leaf tensor owned by a module.
///
/// Gradients live on the current leaf. An optimizer step replaces the leaf
/// with a fresh one, which also discards the old gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParamId,
    name: String,
    tensor: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: NDArray, mode: ExecutionMode) -> Self {
        Parameter {
            id: ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            tensor: Tensor::from_ndarray(value, true, mode),
        }
    }

    /// Parameter holding the current value of `tensor`.
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        Ok(Self::new(name, tensor.realize()?.clone(), tensor.mode()))
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The leaf to build graphs from.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &Shape {
        self.tensor.shape()
    }

    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }

    pub fn grad(&self) -> Option<NDArray> {
        self.tensor.grad_array()
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.tensor.to_vec()
    }

    /// Swap in a new value as a fresh leaf. Shape and dtype must not change.
    pub fn replace(&mut self, value: NDArray) -> Result<()> {
        if value.shape() != self.shape() {
            return Err(TensorError::shape_mismatch(
                "parameter update",
                self.shape(),
                value.shape(),
            ));
        }
        if value.dtype() != self.tensor.dtype() {
            return Err(TensorError::DtypeMismatch {
                op: "parameter update",
                lhs: self.tensor.dtype(),
                rhs: value.dtype(),
            });
        }
        self.tensor = Tensor::from_ndarray(value, true, self.tensor.mode());
        Ok(())
    }
}

/// A differentiable building block.
pub trait Module {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.tensor().zero_grad();
        }
    }
}

/// Modules applied in order.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Module + 'static>(mut self, layer: M) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.layers
            .iter()
            .try_fold(x.clone(), |h, layer| layer.forward(&h))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.parameters_mut())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use needle_backend_cpu::cpu;

    fn config() -> Config {
        Config::new(cpu()).with_dtype(DType::Float64)
    }

    #[test]
    fn test_replace_keeps_identity() {
        let value = NDArray::from_f64(&[1.0, 2.0], [2], DType::Float64, &cpu()).unwrap();
        let mut p = Parameter::new("w", value, ExecutionMode::Lazy);
        let id = p.id();
        assert!(p.tensor().requires_grad());

        p.tensor().mul(p.tensor()).unwrap().sum(None, false).unwrap().backward().unwrap();
        assert!(p.grad().is_some());

        let next = NDArray::from_f64(&[0.5, 0.5], [2], DType::Float64, &cpu()).unwrap();
        p.replace(next).unwrap();
        assert_eq!(p.id(), id);
        assert!(p.grad().is_none());
        assert_eq!(p.to_vec().unwrap(), vec![0.5, 0.5]);

        let wrong = NDArray::zeros([3], DType::Float64, &cpu()).unwrap();
        assert!(matches!(
            p.replace(wrong),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_tensor() {
        let t = Tensor::constant(&[3.0], [1], &config()).unwrap();
        let p = Parameter::from_tensor("c", &t).unwrap();
        assert_eq!(p.name(), "c");
        assert!(p.tensor().requires_grad());
        assert!(!p.tensor().ptr_eq(&t));
    }
}
