//! ndwarp - geometric resampling of detector frames
//!
//! A [`SampleTable`] maps every output pixel to a few weighted input samples.
//! Tables are built either from an affine transform ([`build_from_affine`])
//! or from a detector's calibration index matrices
//! ([`build_from_index_matrices`]), and applied to frames of any supported
//! element type by [`engine::apply`]. [`Pipeline`] ties both together with
//! live, atomically swapped table updates.

pub mod buffer;
pub mod config;
pub mod element;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod restoration;
pub mod table;
pub mod transform;

pub use buffer::{BufferData, ImageBuffer};
pub use config::{Config, Interpolation, PipelineMode, TransformConfig};
pub use element::{Element, ElementType};
pub use error::{Result, WarpError};
pub use pipeline::{Pipeline, RunStats};
pub use restoration::{
    build_from_index_matrices, CalibrationMatrices, DeviceModel, IndexMatrixBackend,
    RestorationBackend,
};
pub use table::{SampleEntry, SampleTable};
pub use transform::{build_from_affine, AffineTransform};
