//! Detector restoration from per-axis calibration index matrices
//!
//! A restoration is a fixed geometric correction for one detector model.
//! Two matrices `ix`/`iy` of `side x side` signed 32-bit integers give, for
//! every restored pixel, the column and row of the raw frame it is read from.
//! They are stored on disk as `{dir}/x<model>.b` and `{dir}/y<model>.b`, flat
//! arrays in native byte order.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{Result, WarpError};
use crate::table::{SampleEntry, SampleTable};

/// Detector model, which fixes the restored pixel grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceModel {
    /// 1536 x 1536 restored grid
    Pi135D,
    /// 3072 x 3072 restored grid
    Pi540D,
    /// Arbitrary square grid, for test rigs and simulated detectors
    Custom { side: usize },
}

impl DeviceModel {
    /// Edge length of the restored grid in pixels
    pub fn side(&self) -> usize {
        match self {
            DeviceModel::Pi135D => 1536,
            DeviceModel::Pi540D => 3072,
            DeviceModel::Custom { side } => *side,
        }
    }

    /// Restored pixel count, saturating for sides no detector could have
    pub fn pixels(&self) -> usize {
        self.side().saturating_mul(self.side())
    }

    /// Suffix used in calibration file names
    pub fn file_tag(&self) -> String {
        match self {
            DeviceModel::Pi135D => "135D".to_string(),
            DeviceModel::Pi540D => "540D".to_string(),
            DeviceModel::Custom { side } => side.to_string(),
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceModel::Pi135D => f.write_str("pi135d"),
            DeviceModel::Pi540D => f.write_str("pi540d"),
            DeviceModel::Custom { side } => write!(f, "custom:{}", side),
        }
    }
}

impl FromStr for DeviceModel {
    type Err = WarpError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "pi135d" | "135d" => Ok(DeviceModel::Pi135D),
            "pi540d" | "540d" => Ok(DeviceModel::Pi540D),
            other => other
                .strip_prefix("custom:")
                .and_then(|side| side.parse::<usize>().ok())
                .filter(|&side| side > 0 && matrix_bytes(side).is_some())
                .map(|side| DeviceModel::Custom { side })
                .ok_or_else(|| WarpError::Configuration(format!("unknown device model '{}'", s))),
        }
    }
}

impl TryFrom<String> for DeviceModel {
    type Error = WarpError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DeviceModel> for String {
    fn from(model: DeviceModel) -> Self {
        model.to_string()
    }
}

/// Size in bytes of one `side x side` matrix of `i32`, if it fits in `usize`
fn matrix_bytes(side: usize) -> Option<usize> {
    side.checked_mul(side)?
        .checked_mul(std::mem::size_of::<i32>())
}

/// A pair of per-axis index matrices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationMatrices {
    side: usize,
    ix: Vec<i32>,
    iy: Vec<i32>,
}

impl CalibrationMatrices {
    pub fn new(side: usize, ix: Vec<i32>, iy: Vec<i32>) -> Result<Self> {
        let expected = side.saturating_mul(side);
        if side == 0 || ix.len() != expected || iy.len() != expected {
            return Err(WarpError::InvalidCalibration(format!(
                "matrices of side {} need {} entries each, got {} and {}",
                side,
                expected,
                ix.len(),
                iy.len()
            )));
        }
        Ok(Self { side, ix, iy })
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn ix(&self) -> &[i32] {
        &self.ix
    }

    pub fn iy(&self) -> &[i32] {
        &self.iy
    }

    /// `(x file, y file)` for a model inside `dir`
    pub fn paths(dir: &Path, model: DeviceModel) -> (PathBuf, PathBuf) {
        let tag = model.file_tag();
        (
            dir.join(format!("x{}.b", tag)),
            dir.join(format!("y{}.b", tag)),
        )
    }

    /// Check both files exist, are readable, and have the model's size
    pub fn check_readable(dir: &Path, model: DeviceModel) -> Result<()> {
        let (x_path, y_path) = Self::paths(dir, model);
        let expected = matrix_bytes(model.side()).ok_or_else(|| {
            WarpError::InvalidCalibration(format!("model {} is too large to load", model))
        })? as u64;

        for path in [&x_path, &y_path] {
            let meta = std::fs::metadata(path).map_err(|e| {
                WarpError::InvalidCalibration(format!("cannot access {:?}: {}", path, e))
            })?;
            if !meta.is_file() {
                return Err(WarpError::InvalidCalibration(format!(
                    "{:?} is not a regular file",
                    path
                )));
            }
            if meta.len() != expected {
                return Err(WarpError::InvalidCalibration(format!(
                    "{:?} holds {} bytes, model {} needs {}",
                    path,
                    meta.len(),
                    model,
                    expected
                )));
            }
            std::fs::File::open(path).map_err(|e| {
                WarpError::InvalidCalibration(format!("cannot open {:?}: {}", path, e))
            })?;
        }
        Ok(())
    }

    /// Read both matrices for `model` from `dir`
    pub fn load(dir: &Path, model: DeviceModel) -> Result<Self> {
        Self::check_readable(dir, model)?;
        let (x_path, y_path) = Self::paths(dir, model);

        let ix = read_i32_file(&x_path)?;
        let iy = read_i32_file(&y_path)?;
        debug!("Read calibration matrices {:?} and {:?}", x_path, y_path);

        Self::new(model.side(), ix, iy)
    }
}

fn read_i32_file(path: &Path) -> Result<Vec<i32>> {
    let bytes = std::fs::read(path)
        .map_err(|e| WarpError::InvalidCalibration(format!("cannot read {:?}: {}", path, e)))?;
    if bytes.len() % std::mem::size_of::<i32>() != 0 {
        return Err(WarpError::InvalidCalibration(format!(
            "{:?} is not a whole number of 32-bit integers",
            path
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

/// Build a restoration table: output pixel `k` reads `iy[k] * input_width + ix[k]`.
///
/// Indices outside the input on either axis become invalid entries.
/// `block_size` only sets the tile edge used while traversing the matrices.
pub fn build_from_index_matrices(
    matrices: &CalibrationMatrices,
    model: DeviceModel,
    input_width: usize,
    input_height: usize,
    block_size: usize,
) -> Result<SampleTable> {
    let side = matrices.side();
    if side != model.side() {
        return Err(WarpError::InvalidCalibration(format!(
            "matrix side {} does not match model {} ({} px)",
            side,
            model,
            model.side()
        )));
    }
    if block_size == 0 {
        return Err(WarpError::Configuration("block size must be at least 1".into()));
    }
    if input_width == 0 || input_height == 0 {
        return Err(WarpError::Configuration(format!(
            "input must be non-empty, got {}x{}",
            input_width, input_height
        )));
    }
    let block_size = block_size.min(side);

    let mut entries = vec![SampleEntry::invalid(); side * side];

    // One band of `block_size` rows per task, walked tile by tile
    entries
        .par_chunks_mut(block_size * side)
        .enumerate()
        .for_each(|(band, rows)| {
            let y_start = band * block_size;
            let band_rows = rows.len() / side;
            for tile_x in (0..side).step_by(block_size) {
                let tile_end = (tile_x + block_size).min(side);
                for dy in 0..band_rows {
                    let k_row = (y_start + dy) * side;
                    for x in tile_x..tile_end {
                        let k = k_row + x;
                        rows[dy * side + x] =
                            restored_entry(matrices.ix[k], matrices.iy[k], input_width, input_height);
                    }
                }
            }
        });

    SampleTable::new((input_width, input_height), (side, side), 1, entries)
}

#[inline]
fn restored_entry(x: i32, y: i32, width: usize, height: usize) -> SampleEntry {
    if x < 0 || y < 0 || x as usize >= width || y as usize >= height {
        return SampleEntry::invalid();
    }
    SampleEntry::new(y as usize * width + x as usize, 1.0)
}

/// Summary of the last table a backend built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub model: DeviceModel,
    pub input_shape: (usize, usize),
    pub block_size: usize,
    pub tiles: usize,
    pub invalid_pixels: usize,
}

/// Derives restoration tables from calibration matrices
pub trait RestorationBackend: Send {
    /// Consume a matrix pair and produce a table for frames of the given size
    fn build_from_index_matrices(
        &mut self,
        matrices: CalibrationMatrices,
        input_width: usize,
        input_height: usize,
    ) -> Result<SampleTable>;

    /// Drop whatever the previous build left behind
    fn release_workspace(&mut self);

    fn has_workspace(&self) -> bool;
}

/// Backend that maps matrix entries straight to source indices
#[derive(Debug)]
pub struct IndexMatrixBackend {
    model: DeviceModel,
    block_size: usize,
    workspace: Option<Workspace>,
}

impl IndexMatrixBackend {
    pub fn new(model: DeviceModel, block_size: usize) -> Self {
        Self {
            model,
            block_size,
            workspace: None,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }
}

impl RestorationBackend for IndexMatrixBackend {
    fn build_from_index_matrices(
        &mut self,
        matrices: CalibrationMatrices,
        input_width: usize,
        input_height: usize,
    ) -> Result<SampleTable> {
        self.release_workspace();

        let table = build_from_index_matrices(
            &matrices,
            self.model,
            input_width,
            input_height,
            self.block_size,
        )?;

        let tiles_per_axis = matrices.side().div_ceil(self.block_size.min(matrices.side()));
        self.workspace = Some(Workspace {
            model: self.model,
            input_shape: (input_width, input_height),
            block_size: self.block_size,
            tiles: tiles_per_axis * tiles_per_axis,
            invalid_pixels: table.invalid_pixels(),
        });
        info!(
            "Built restoration table for {} ({}x{} from {}x{}, {} invalid pixels)",
            self.model,
            matrices.side(),
            matrices.side(),
            input_width,
            input_height,
            table.invalid_pixels()
        );

        Ok(table)
    }

    fn release_workspace(&mut self) {
        if self.workspace.take().is_some() {
            debug!("Released restoration workspace for {}", self.model);
        }
    }

    fn has_workspace(&self) -> bool {
        self.workspace.is_some()
    }
}

/// Detects 0 -> 1 transitions of a control value
#[derive(Debug, Clone, Copy, Default)]
pub struct RisingEdge {
    level: bool,
}

impl RisingEdge {
    /// Record a write; true only when the level goes from low to high
    pub fn update(&mut self, level: bool) -> bool {
        let fired = level && !self.level;
        self.level = level;
        fired
    }

    pub fn level(&self) -> bool {
        self.level
    }
}
