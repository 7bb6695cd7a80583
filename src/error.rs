//! Error types for table building and resampling

use thiserror::Error;

/// Errors reported by the sample table builders and the resampling engine.
///
/// Every variant is detected before any output buffer is allocated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WarpError {
    /// Wrong dimensionality, zero extent, or input/table shape mismatch
    #[error("shape error: {0}")]
    Shape(String),

    /// Element type outside the supported numeric kinds
    #[error("unsupported element type: {0}")]
    UnsupportedType(String),

    /// Non-finite or degenerate transform parameters
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Calibration matrices missing, unreadable, or not matching the device model
    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),
}

pub type Result<T> = std::result::Result<T, WarpError>;
