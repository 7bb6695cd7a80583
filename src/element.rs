//! Numeric element types supported by the resampling engine
//!
//! Accumulation always happens in `f64`. Storing back into an integer type
//! truncates toward zero and saturates at the type bounds (NaN stores 0),
//! which is exactly what an `as` cast from `f64` does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WarpError;

/// Element type tag of an image buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl ElementType {
    pub fn name(&self) -> &'static str {
        match self {
            ElementType::Int8 => "int8",
            ElementType::UInt8 => "uint8",
            ElementType::Int16 => "int16",
            ElementType::UInt16 => "uint16",
            ElementType::Int32 => "int32",
            ElementType::UInt32 => "uint32",
            ElementType::Float32 => "float32",
            ElementType::Float64 => "float64",
        }
    }

    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::Int8 | ElementType::UInt8 => 1,
            ElementType::Int16 | ElementType::UInt16 => 2,
            ElementType::Int32 | ElementType::UInt32 | ElementType::Float32 => 4,
            ElementType::Float64 => 8,
        }
    }

    pub fn all() -> &'static [ElementType] {
        &[
            ElementType::Int8,
            ElementType::UInt8,
            ElementType::Int16,
            ElementType::UInt16,
            ElementType::Int32,
            ElementType::UInt32,
            ElementType::Float32,
            ElementType::Float64,
        ]
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ElementType {
    type Err = WarpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int8" | "i8" => Ok(ElementType::Int8),
            "uint8" | "u8" => Ok(ElementType::UInt8),
            "int16" | "i16" => Ok(ElementType::Int16),
            "uint16" | "u16" => Ok(ElementType::UInt16),
            "int32" | "i32" => Ok(ElementType::Int32),
            "uint32" | "u32" => Ok(ElementType::UInt32),
            "float32" | "f32" => Ok(ElementType::Float32),
            "float64" | "f64" => Ok(ElementType::Float64),
            other => Err(WarpError::UnsupportedType(other.to_string())),
        }
    }
}

/// A pixel value the engine knows how to read and write
pub trait Element: bytemuck::Pod + Send + Sync {
    const TYPE: ElementType;

    fn to_f64(self) -> f64;

    /// Convert an accumulated value back to the element type
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $tag:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const TYPE: ElementType = ElementType::$tag;

                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $t
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    f32 => Float32,
    f64 => Float64,
}
