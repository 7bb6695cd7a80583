//! Sample tables: precomputed output-pixel to input-sample mappings

use rayon::prelude::*;

use crate::error::{Result, WarpError};

/// One weighted input sample contributing to an output pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEntry {
    /// Linear offset into the input buffer
    pub source_index: usize,
    pub weight: f64,
    /// `false` when the source is out of bounds or undefined
    pub valid: bool,
}

impl SampleEntry {
    #[inline]
    pub fn new(source_index: usize, weight: f64) -> Self {
        Self {
            source_index,
            weight,
            valid: true,
        }
    }

    #[inline]
    pub fn invalid() -> Self {
        Self {
            source_index: 0,
            weight: 0.0,
            valid: false,
        }
    }
}

/// Dense mapping from every output pixel to `samples_per_pixel` entries
///
/// Entries are stored output-row-major, each pixel's entries contiguous.
/// A table never changes after construction; callers share it behind an
/// `Arc` and replace it wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTable {
    input_width: usize,
    input_height: usize,
    output_width: usize,
    output_height: usize,
    samples_per_pixel: usize,
    entries: Vec<SampleEntry>,
}

impl SampleTable {
    pub fn new(
        input: (usize, usize),
        output: (usize, usize),
        samples_per_pixel: usize,
        entries: Vec<SampleEntry>,
    ) -> Result<Self> {
        let (input_width, input_height) = input;
        let (output_width, output_height) = output;

        if input_width == 0 || input_height == 0 || output_width == 0 || output_height == 0 {
            return Err(WarpError::Shape(format!(
                "table dimensions must be nonzero (input {}x{}, output {}x{})",
                input_width, input_height, output_width, output_height
            )));
        }
        if samples_per_pixel == 0 {
            return Err(WarpError::Shape("samples per pixel must be at least 1".into()));
        }

        let expected = output_width
            .checked_mul(output_height)
            .and_then(|n| n.checked_mul(samples_per_pixel))
            .ok_or_else(|| WarpError::Shape("table dimensions overflow".into()))?;
        if entries.len() != expected {
            return Err(WarpError::Shape(format!(
                "expected {} entries, got {}",
                expected,
                entries.len()
            )));
        }

        let input_len = input_width * input_height;
        if let Some(bad) = entries
            .iter()
            .find(|e| e.valid && e.source_index >= input_len)
        {
            return Err(WarpError::Shape(format!(
                "source index {} outside input of {} elements",
                bad.source_index, input_len
            )));
        }

        Ok(Self {
            input_width,
            input_height,
            output_width,
            output_height,
            samples_per_pixel,
            entries,
        })
    }

    /// One valid entry of weight 1.0 per pixel, mapping each pixel to itself
    pub fn identity(width: usize, height: usize) -> Result<Self> {
        let entries = (0..width * height).map(|i| SampleEntry::new(i, 1.0)).collect();
        Self::new((width, height), (width, height), 1, entries)
    }

    pub fn input_shape(&self) -> (usize, usize) {
        (self.input_width, self.input_height)
    }

    pub fn output_shape(&self) -> (usize, usize) {
        (self.output_width, self.output_height)
    }

    pub fn samples_per_pixel(&self) -> usize {
        self.samples_per_pixel
    }

    /// Entries of the output pixel at linear position `index`
    pub fn pixel(&self, index: usize) -> &[SampleEntry] {
        let start = index * self.samples_per_pixel;
        &self.entries[start..start + self.samples_per_pixel]
    }

    /// Entries grouped per output row, as a parallel iterator
    pub fn par_rows(&self) -> rayon::slice::Chunks<'_, SampleEntry> {
        self.entries.par_chunks(self.output_width * self.samples_per_pixel)
    }

    /// Number of output pixels that will be forced to zero
    pub fn invalid_pixels(&self) -> usize {
        self.entries
            .chunks(self.samples_per_pixel)
            .filter(|px| px.iter().any(|e| !e.valid))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_table() {
        let table = SampleTable::identity(3, 2).unwrap();
        assert_eq!(table.output_shape(), (3, 2));
        assert_eq!(table.samples_per_pixel(), 1);
        for i in 0..6 {
            assert_eq!(table.pixel(i), &[SampleEntry::new(i, 1.0)]);
        }
        assert_eq!(table.invalid_pixels(), 0);
    }

    #[test]
    fn test_rejects_wrong_entry_count() {
        let err = SampleTable::new((2, 2), (2, 2), 4, vec![SampleEntry::invalid(); 15]).unwrap_err();
        assert!(matches!(err, WarpError::Shape(_)));
    }

    #[test]
    fn test_rejects_out_of_range_valid_entry() {
        let mut entries = vec![SampleEntry::invalid(); 4];
        entries[0] = SampleEntry::new(4, 1.0);
        assert!(SampleTable::new((2, 2), (2, 2), 1, entries).is_err());
    }

    #[test]
    fn test_out_of_range_invalid_entry_is_allowed() {
        let mut entries = vec![SampleEntry::new(0, 1.0); 4];
        entries[3] = SampleEntry {
            source_index: 1000,
            weight: 1.0,
            valid: false,
        };
        let table = SampleTable::new((2, 2), (2, 2), 1, entries).unwrap();
        assert_eq!(table.invalid_pixels(), 1);
    }

    #[test]
    fn test_rows() {
        let table = SampleTable::identity(4, 3).unwrap();
        let rows: Vec<_> = table.par_rows().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2][0].source_index, 8);
    }
}
