//! Error types for needle_tensor.

use thiserror::Error;

use crate::dtype::DType;
use crate::shape::Shape;

/// Errors raised while building, realizing or differentiating tensors.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Shapes cannot be combined, even after broadcasting.
    #[error("shape mismatch in {op}: {lhs} vs {rhs}")]
    ShapeMismatch { op: &'static str, lhs: Shape, rhs: Shape },

    /// Operands carry different dtypes.
    #[error("dtype mismatch in {op}: {lhs} vs {rhs}")]
    DtypeMismatch {
        op: &'static str,
        lhs: DType,
        rhs: DType,
    },

    /// Operands live on different devices.
    #[error("device mismatch in {op}: {lhs} vs {rhs}")]
    DeviceMismatch {
        op: &'static str,
        lhs: String,
        rhs: String,
    },

    /// `grad()` was read on a node no backward pass has reached.
    #[error("gradient unavailable for node {node}: no completed backward pass reached it")]
    GradientUnavailable { node: u64 },

    /// The backend does not implement the requested primitive.
    #[error("backend `{backend}` does not implement `{primitive}`")]
    UnsupportedOperation {
        backend: String,
        primitive: &'static str,
    },

    /// No backend is registered under the requested device tag.
    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    /// Axis out of range for the tensor rank.
    #[error("axis {axis} out of range for tensor of rank {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },

    /// Any other malformed argument (bad permutation, empty stack, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Forward computation failed while a deferred tensor was being realized.
    #[error("failed to realize `{op}`: {source}")]
    Realization {
        op: &'static str,
        #[source]
        source: Box<TensorError>,
    },
}

impl TensorError {
    pub fn shape_mismatch(op: &'static str, lhs: &Shape, rhs: &Shape) -> Self {
        TensorError::ShapeMismatch {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }
    }

    pub fn unsupported(backend: &str, primitive: &'static str) -> Self {
        TensorError::UnsupportedOperation {
            backend: backend.to_string(),
            primitive,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        TensorError::InvalidArgument(msg.into())
    }

    /// The underlying error, looking through `Realization` wrappers.
    pub fn root_cause(&self) -> &TensorError {
        match self {
            TensorError::Realization { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TensorError>;
