//! Resampling engine: applies a sample table to one frame
//!
//! Each output pixel is `sum(weight * input[source_index])` over its entries,
//! accumulated in `f64` and stored with [`Element::from_f64`] (integers
//! truncate toward zero and saturate). If any entry of a pixel is invalid
//! the pixel is stored as zero, whatever the other entries hold.
//!
//! Pixels are independent, so output rows are split across the rayon pool.

use rayon::prelude::*;

use crate::buffer::{BufferData, ImageBuffer};
use crate::element::Element;
use crate::error::{Result, WarpError};
use crate::table::{SampleEntry, SampleTable};

/// Resample `input` through `table`, producing a buffer of the table's output shape
pub fn apply(input: &ImageBuffer, table: &SampleTable) -> Result<ImageBuffer> {
    apply_expecting(input, table, table.output_shape())
}

/// Like [`apply`], but also require the table to produce `expected_output`
pub fn apply_expecting(
    input: &ImageBuffer,
    table: &SampleTable,
    expected_output: (usize, usize),
) -> Result<ImageBuffer> {
    let input_shape = input.shape_2d()?;

    if input_shape != table.input_shape() {
        return Err(WarpError::Shape(format!(
            "input is {}x{} but the table expects {}x{}",
            input_shape.0,
            input_shape.1,
            table.input_shape().0,
            table.input_shape().1
        )));
    }
    if table.output_shape() != expected_output {
        return Err(WarpError::Shape(format!(
            "table produces {}x{} but {}x{} is expected",
            table.output_shape().0,
            table.output_shape().1,
            expected_output.0,
            expected_output.1
        )));
    }

    let data = match input.data() {
        BufferData::Int8(src) => BufferData::Int8(resample(src, table)),
        BufferData::UInt8(src) => BufferData::UInt8(resample(src, table)),
        BufferData::Int16(src) => BufferData::Int16(resample(src, table)),
        BufferData::UInt16(src) => BufferData::UInt16(resample(src, table)),
        BufferData::Int32(src) => BufferData::Int32(resample(src, table)),
        BufferData::UInt32(src) => BufferData::UInt32(resample(src, table)),
        BufferData::Float32(src) => BufferData::Float32(resample(src, table)),
        BufferData::Float64(src) => BufferData::Float64(resample(src, table)),
    };

    let (width, height) = table.output_shape();
    ImageBuffer::new(vec![width, height], data)
}

fn resample<T: Element>(src: &[T], table: &SampleTable) -> Vec<T> {
    let (width, height) = table.output_shape();
    let spp = table.samples_per_pixel();
    let mut out = vec![T::from_f64(0.0); width * height];

    out.par_chunks_mut(width)
        .zip(table.par_rows())
        .for_each(|(dst_row, entry_row)| {
            for (dst, px) in dst_row.iter_mut().zip(entry_row.chunks_exact(spp)) {
                *dst = T::from_f64(accumulate(src, px));
            }
        });

    out
}

/// Weighted sum of one pixel's samples, or 0 when any sample is invalid
#[inline]
fn accumulate<T: Element>(src: &[T], px: &[SampleEntry]) -> f64 {
    let mut val = 0.0;
    for entry in px {
        if !entry.valid {
            return 0.0;
        }
        val += entry.weight * src[entry.source_index].to_f64();
    }
    val
}
