//! Shape and stride utilities for tensors.

use std::fmt;

use crate::error::{Result, TensorError};

/// A tensor shape (dimensions).
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Create a scalar shape (0-dimensional).
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Get dimension at index.
    pub fn dim(&self, idx: usize) -> usize {
        self.0[idx]
    }

    /// Get dimensions as slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Total number of elements. A scalar holds one element.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Check if this is a scalar (0-dim tensor).
    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Compute row-major (C-contiguous) strides for this shape.
    pub fn contiguous_strides(&self) -> Strides {
        let ndim = self.0.len();
        if ndim == 0 {
            return Strides(vec![]);
        }

        let mut strides = vec![1usize; ndim];
        for i in (0..ndim - 1).rev() {
            strides[i] = strides[i + 1] * self.0[i + 1];
        }
        Strides(strides)
    }

    /// Check if two shapes are broadcast-compatible.
    /// Returns the broadcast result shape if compatible.
    pub fn broadcast_with(&self, other: &Shape) -> Option<Shape> {
        let ndim = self.ndim().max(other.ndim());
        let mut result = vec![0usize; ndim];

        for (i, slot) in result.iter_mut().enumerate() {
            let d1 = if i < ndim - self.ndim() {
                1
            } else {
                self.0[i - (ndim - self.ndim())]
            };
            let d2 = if i < ndim - other.ndim() {
                1
            } else {
                other.0[i - (ndim - other.ndim())]
            };

            *slot = if d1 == d2 || d2 == 1 {
                d1
            } else if d1 == 1 {
                d2
            } else {
                return None;
            };
        }

        Some(Shape(result))
    }

    /// Broadcast two shapes, failing with `ShapeMismatch` for `op`.
    pub fn broadcast_for(&self, other: &Shape, op: &'static str) -> Result<Shape> {
        self.broadcast_with(other)
            .ok_or_else(|| TensorError::shape_mismatch(op, self, other))
    }

    /// True when `self` can be stretched to `target` without data changes.
    pub fn broadcastable_to(&self, target: &Shape) -> bool {
        if self.ndim() > target.ndim() {
            return false;
        }
        let offset = target.ndim() - self.ndim();
        self.0
            .iter()
            .enumerate()
            .all(|(i, &d)| d == target.0[offset + i] || d == 1)
    }

    /// Compute which axes need to be reduced when going from broadcast shape back to this shape.
    /// Returns leading axes absent from `self` plus axes stretched from size 1.
    pub fn reduction_axes_from(&self, broadcast_shape: &Shape) -> Vec<usize> {
        let mut axes = Vec::new();
        let offset = broadcast_shape.ndim().saturating_sub(self.ndim());

        // Leading dimensions that don't exist in self
        axes.extend(0..offset);

        // Dimensions that were size 1 in self but expanded
        for i in 0..self.ndim() {
            if self.0[i] == 1 && broadcast_shape.0[offset + i] != 1 {
                axes.push(offset + i);
            }
        }

        axes
    }

    /// Validate an axis against this shape's rank.
    pub fn check_axis(&self, axis: usize) -> Result<usize> {
        if axis < self.ndim() {
            Ok(axis)
        } else {
            Err(TensorError::InvalidAxis {
                axis,
                ndim: self.ndim(),
            })
        }
    }

    /// Resolve an optional axis list (None = every axis) into sorted, unique axes.
    pub fn resolve_axes(&self, axes: Option<&[usize]>) -> Result<Vec<usize>> {
        let mut resolved = match axes {
            Some(axes) => axes
                .iter()
                .map(|&ax| self.check_axis(ax))
                .collect::<Result<Vec<_>>>()?,
            None => (0..self.ndim()).collect(),
        };
        resolved.sort_unstable();
        resolved.dedup();
        Ok(resolved)
    }

    /// Shape after reducing `axes` (already resolved).
    pub fn reduced(&self, axes: &[usize], keepdims: bool) -> Shape {
        let dims = self
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (axes.contains(&i), keepdims) {
                (true, true) => Some(1),
                (true, false) => None,
                (false, _) => Some(d),
            })
            .collect();
        Shape(dims)
    }

    /// Shape with `axes` (resolved) set to 1, i.e. the keepdims form of a reduction.
    pub fn with_ones_at(&self, axes: &[usize]) -> Shape {
        self.reduced(axes, true)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.0)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

/// Tensor strides (step size in each dimension, in elements).
/// A stride of 0 marks a broadcast axis.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct Strides(pub Vec<usize>);

impl Strides {
    pub fn new(strides: Vec<usize>) -> Self {
        Strides(strides)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Compute flat index from multi-dimensional indices.
    pub fn index(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(self.0.len(), indices.len());
        self.0.iter().zip(indices.iter()).map(|(s, i)| s * i).sum()
    }
}

/// Odometer over every multi-dimensional index of a shape, row-major.
pub struct ShapeIndices<'a> {
    shape: &'a Shape,
    current: Vec<usize>,
    done: bool,
}

impl<'a> ShapeIndices<'a> {
    pub fn new(shape: &'a Shape) -> Self {
        ShapeIndices {
            shape,
            current: vec![0; shape.ndim()],
            done: shape.numel() == 0,
        }
    }
}

impl Iterator for ShapeIndices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.current.clone();

        if self.shape.ndim() == 0 {
            self.done = true;
            return Some(result);
        }

        // Increment indices (rightmost first, like odometer)
        let mut i = self.shape.ndim() - 1;
        loop {
            self.current[i] += 1;
            if self.current[i] < self.shape.dim(i) {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
        }

        Some(result)
    }
}
