use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;
pub type Shape = Vec<DimSize>;

/// Scalar element type carried by every tensor and buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Uint8,
    Sint8,
    Uint16,
    Sint16,
    Uint32,
    Sint32,
    Float32,
    Bfloat16,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Uint8 | Dtype::Sint8 => 1,
            Dtype::Uint16 | Dtype::Sint16 | Dtype::Bfloat16 => 2,
            Dtype::Uint32 | Dtype::Sint32 | Dtype::Float32 => 4,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Sint8 => write!(f, "i8"),
            Dtype::Uint16 => write!(f, "u16"),
            Dtype::Sint16 => write!(f, "i16"),
            Dtype::Uint32 => write!(f, "u32"),
            Dtype::Sint32 => write!(f, "i32"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Bfloat16 => write!(f, "bf16"),
        }
    }
}

/// Total bytes of a buffer holding `shape` elements of `dtype`.
pub fn shape_volume_bytes(shape: &[DimSize], dtype: Dtype) -> u64 {
    shape
        .iter()
        .map(|d| u64::from(d.get()))
        .product::<u64>()
        * u64::from(dtype.size())
}

/// Builds a [DimSize] from a `u32` literal; panics on zero.
#[macro_export]
macro_rules! dimsize {
    ($dim:expr) => {{
        let d: $crate::common::DimSize =
            ::std::num::NonZeroU32::new($dim).expect("extent must be nonzero");
        d
    }};
}

/// Builds a [Shape] from `u32` literals; panics on zero extents.
#[macro_export]
macro_rules! shape {
    ($dim:expr; $n:expr) => {{
        let sv: $crate::common::Shape = vec![$crate::dimsize!($dim); $n];
        sv
    }};
    ($($dim:expr),*$(,)*) => {{
        let sv: $crate::common::Shape = vec![$($crate::dimsize!($dim)),*];
        sv
    }};
}
