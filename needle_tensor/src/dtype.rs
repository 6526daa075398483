//! Element types and the typed host buffer.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::str::FromStr;

use crate::error::TensorError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    Float32,
    Float64,
}

impl DType {
    pub fn name(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::Float32),
            "float64" | "f64" => Ok(DType::Float64),
            other => Err(TensorError::invalid(format!("unknown dtype `{other}`"))),
        }
    }
}

/// Scalar types a [`Buffer`] can hold.
///
/// Kernels are written once against this trait and instantiated for
/// `f32` and `f64`.
pub trait Element:
    Copy
    + Send
    + Sync
    + fmt::Debug
    + PartialOrd
    + Default
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;
    fn one() -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;

    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn tanh(self) -> Self;
    fn sqrt(self) -> Self;
    fn powf(self, e: Self) -> Self;
    fn max_of(self, other: Self) -> Self;
    fn neg_infinity() -> Self;

    /// Wrap a vector of this element type into a tagged buffer.
    fn into_buffer(data: Vec<Self>) -> Buffer;

    /// View a buffer as this element type, if the tags agree.
    fn slice_of(buffer: &Buffer) -> Option<&[Self]>;

    /// Mutable view, if the tags agree.
    fn slice_of_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            fn zero() -> Self {
                0.0
            }

            fn one() -> Self {
                1.0
            }

            fn from_f64(v: f64) -> Self {
                v as $t
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn exp(self) -> Self {
                <$t>::exp(self)
            }

            fn ln(self) -> Self {
                <$t>::ln(self)
            }

            fn tanh(self) -> Self {
                <$t>::tanh(self)
            }

            fn sqrt(self) -> Self {
                <$t>::sqrt(self)
            }

            fn powf(self, e: Self) -> Self {
                <$t>::powf(self, e)
            }

            /// NaN wins, so it propagates through relu, maximum and max.
            fn max_of(self, other: Self) -> Self {
                if self.is_nan() || self > other {
                    self
                } else {
                    other
                }
            }

            fn neg_infinity() -> Self {
                <$t>::NEG_INFINITY
            }

            fn into_buffer(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }

            fn slice_of(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn slice_of_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f32, F32, DType::Float32);
impl_element!(f64, F64, DType::Float64);

/// Flat host buffer tagged with its element type.
#[derive(Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    /// Buffer of `len` copies of `value`, converted to `dtype`.
    pub fn filled(dtype: DType, len: usize, value: f64) -> Self {
        match dtype {
            DType::Float32 => Buffer::F32(vec![value as f32; len]),
            DType::Float64 => Buffer::F64(vec![value; len]),
        }
    }

    /// Buffer holding `values` converted to `dtype`.
    pub fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::Float32 => Buffer::F32(values.iter().map(|&v| v as f32).collect()),
            DType::Float64 => Buffer::F64(values.to_vec()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::Float32,
            Buffer::F64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `idx` as f64.
    pub fn get_f64(&self, idx: usize) -> f64 {
        match self {
            Buffer::F32(v) => v[idx] as f64,
            Buffer::F64(v) => v[idx],
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer<{}>[{}]", self.dtype(), self.len())
    }
}
