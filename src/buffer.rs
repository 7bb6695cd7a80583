//! Typed, row-major image buffers exchanged with the host
//!
//! `dims[0]` is the fastest-varying axis (width), `dims[1]` the row count
//! (height). Buffers of any dimensionality can be described so that the
//! engine is able to reject the ones that are not 2-D.

use crate::element::{Element, ElementType};
use crate::error::{Result, WarpError};

/// Owned pixel storage, one variant per supported element type
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int16(Vec<i16>),
    UInt16(Vec<u16>),
    Int32(Vec<i32>),
    UInt32(Vec<u32>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl BufferData {
    pub fn element_type(&self) -> ElementType {
        match self {
            BufferData::Int8(_) => ElementType::Int8,
            BufferData::UInt8(_) => ElementType::UInt8,
            BufferData::Int16(_) => ElementType::Int16,
            BufferData::UInt16(_) => ElementType::UInt16,
            BufferData::Int32(_) => ElementType::Int32,
            BufferData::UInt32(_) => ElementType::UInt32,
            BufferData::Float32(_) => ElementType::Float32,
            BufferData::Float64(_) => ElementType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BufferData::Int8(v) => v.len(),
            BufferData::UInt8(v) => v.len(),
            BufferData::Int16(v) => v.len(),
            BufferData::UInt16(v) => v.len(),
            BufferData::Int32(v) => v.len(),
            BufferData::UInt32(v) => v.len(),
            BufferData::Float32(v) => v.len(),
            BufferData::Float64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-filled storage of `len` elements
    pub fn zeros(ty: ElementType, len: usize) -> Self {
        match ty {
            ElementType::Int8 => BufferData::Int8(vec![0; len]),
            ElementType::UInt8 => BufferData::UInt8(vec![0; len]),
            ElementType::Int16 => BufferData::Int16(vec![0; len]),
            ElementType::UInt16 => BufferData::UInt16(vec![0; len]),
            ElementType::Int32 => BufferData::Int32(vec![0; len]),
            ElementType::UInt32 => BufferData::UInt32(vec![0; len]),
            ElementType::Float32 => BufferData::Float32(vec![0.0; len]),
            ElementType::Float64 => BufferData::Float64(vec![0.0; len]),
        }
    }

    /// Decode raw native-endian bytes into typed storage
    pub fn from_ne_bytes(ty: ElementType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % ty.size_bytes() != 0 {
            return Err(WarpError::Shape(format!(
                "{} bytes is not a whole number of {} elements",
                bytes.len(),
                ty
            )));
        }

        Ok(match ty {
            ElementType::Int8 => BufferData::Int8(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::UInt8 => BufferData::UInt8(bytes.to_vec()),
            ElementType::Int16 => BufferData::Int16(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::UInt16 => BufferData::UInt16(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::Int32 => BufferData::Int32(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::UInt32 => BufferData::UInt32(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::Float32 => BufferData::Float32(bytemuck::pod_collect_to_vec(bytes)),
            ElementType::Float64 => BufferData::Float64(bytemuck::pod_collect_to_vec(bytes)),
        })
    }

    /// Raw native-endian view of the storage
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            BufferData::Int8(v) => bytemuck::cast_slice(v),
            BufferData::UInt8(v) => v.as_slice(),
            BufferData::Int16(v) => bytemuck::cast_slice(v),
            BufferData::UInt16(v) => bytemuck::cast_slice(v),
            BufferData::Int32(v) => bytemuck::cast_slice(v),
            BufferData::UInt32(v) => bytemuck::cast_slice(v),
            BufferData::Float32(v) => bytemuck::cast_slice(v),
            BufferData::Float64(v) => bytemuck::cast_slice(v),
        }
    }
}

/// Conversion between a typed `Vec<T>` and [`BufferData`]
pub trait IntoBufferData: Element {
    fn into_data(values: Vec<Self>) -> BufferData;
    fn slice(data: &BufferData) -> Option<&[Self]>;
}

macro_rules! impl_into_buffer_data {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoBufferData for $t {
                fn into_data(values: Vec<Self>) -> BufferData {
                    BufferData::$variant(values)
                }

                fn slice(data: &BufferData) -> Option<&[Self]> {
                    match data {
                        BufferData::$variant(v) => Some(v.as_slice()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_into_buffer_data! {
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    f32 => Float32,
    f64 => Float64,
}

/// An image frame: a shape plus typed storage
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    dims: Vec<usize>,
    data: BufferData,
}

impl ImageBuffer {
    /// Wrap storage with an explicit shape; the element count must match
    pub fn new(dims: Vec<usize>, data: BufferData) -> Result<Self> {
        let expected = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| WarpError::Shape(format!("dimensions {:?} overflow", dims)))?;

        if data.len() != expected {
            return Err(WarpError::Shape(format!(
                "dimensions {:?} need {} elements, got {}",
                dims,
                expected,
                data.len()
            )));
        }

        Ok(Self { dims, data })
    }

    pub fn from_vec<T: IntoBufferData>(width: usize, height: usize, values: Vec<T>) -> Result<Self> {
        Self::new(vec![width, height], T::into_data(values))
    }

    pub fn zeros(ty: ElementType, width: usize, height: usize) -> Self {
        Self {
            dims: vec![width, height],
            data: BufferData::zeros(ty, width * height),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn width(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    pub fn height(&self) -> usize {
        self.dims.get(1).copied().unwrap_or(0)
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    /// Typed view, `None` when `T` is not the buffer's element type
    pub fn as_slice<T: IntoBufferData>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// `(width, height)` of a 2-D buffer with nonzero extents
    pub fn shape_2d(&self) -> Result<(usize, usize)> {
        if self.dims.len() != 2 {
            return Err(WarpError::Shape(format!(
                "2-D buffer expected, got {} dimension(s)",
                self.dims.len()
            )));
        }
        let (width, height) = (self.dims[0], self.dims[1]);
        if width == 0 || height == 0 {
            return Err(WarpError::Shape(format!(
                "non-empty buffer expected, got {}x{}",
                width, height
            )));
        }
        Ok((width, height))
    }
}
