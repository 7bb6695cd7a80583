//! Per-frame processing with live table updates
//!
//! The pipeline owns the currently installed sample tables. Frames are
//! resampled against an `Arc` snapshot of a table, so a rebuild running on
//! another thread never changes the table under an in-flight frame: new tables
//! are built off to the side and published with a single swap. Rebuilds are
//! serialized by one lock.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::ImageBuffer;
use crate::config::{Config, PipelineMode, RestorationConfig, TransformConfig};
use crate::engine;
use crate::error::{Result, WarpError};
use crate::restoration::{CalibrationMatrices, IndexMatrixBackend, RestorationBackend, RisingEdge};
use crate::table::SampleTable;
use crate::transform::build_from_affine;

/// Processing statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    /// Frames resampled successfully
    pub frames: u64,
    /// Frames rejected with an error
    pub rejected: u64,
    /// Wall time of the last resample in milliseconds
    pub last_run_time_ms: f64,
    pub total_run_time_ms: f64,
    /// Tables built and installed
    pub rebuilds: u64,
}

impl RunStats {
    pub fn average_run_time_ms(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.total_run_time_ms / self.frames as f64
        }
    }
}

/// State touched only while holding the rebuild lock
struct RebuildState {
    backend: Box<dyn RestorationBackend>,
    load_edge: RisingEdge,
    /// Set once the calibration files of the last rising edge checked out
    load_valid: bool,
    /// Shape of the last frame seen in warp mode
    frame_shape: Option<(usize, usize)>,
}

/// Shared resampling state
pub struct Pipeline {
    config: Arc<RwLock<Config>>,
    warp_table: ArcSwapOption<SampleTable>,
    restore_table: ArcSwapOption<SampleTable>,
    rebuild: Mutex<RebuildState>,
    stats: Mutex<RunStats>,
}

impl Pipeline {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        let backend = {
            let cfg = config.read();
            IndexMatrixBackend::new(cfg.restoration.model, cfg.restoration.block_size)
        };
        Self::with_backend(config, Box::new(backend))
    }

    /// Use a custom restoration backend
    pub fn with_backend(config: Arc<RwLock<Config>>, backend: Box<dyn RestorationBackend>) -> Self {
        Self {
            config,
            warp_table: ArcSwapOption::empty(),
            restore_table: ArcSwapOption::empty(),
            rebuild: Mutex::new(RebuildState {
                backend,
                load_edge: RisingEdge::default(),
                load_valid: false,
                frame_shape: None,
            }),
            stats: Mutex::new(RunStats::default()),
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.config.read().pipeline.mode
    }

    pub fn set_mode(&self, mode: PipelineMode) {
        self.config.write().pipeline.mode = mode;
        info!("Pipeline mode set to {:?}", mode);
    }

    pub fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    /// Table used for the current mode, if one is installed
    pub fn current_table(&self) -> Option<Arc<SampleTable>> {
        match self.mode() {
            PipelineMode::Warp => self.warp_table.load_full(),
            PipelineMode::Restore => self.restore_table.load_full(),
        }
    }

    pub fn stats(&self) -> RunStats {
        self.stats.lock().clone()
    }

    /// Whether the calibration files of the last load trigger checked out
    pub fn load_valid(&self) -> bool {
        self.rebuild.lock().load_valid
    }

    /// Resample one frame with the table of the current mode
    pub fn process(&self, frame: &ImageBuffer) -> Result<ImageBuffer> {
        let result = self.process_inner(frame);
        if let Err(e) = &result {
            self.stats.lock().rejected += 1;
            debug!("Frame rejected: {}", e);
        }
        result
    }

    fn process_inner(&self, frame: &ImageBuffer) -> Result<ImageBuffer> {
        let shape = frame.shape_2d()?;

        let (table, expected) = match self.mode() {
            PipelineMode::Warp => (self.warp_table_for(shape)?, shape),
            PipelineMode::Restore => {
                let table = self.restore_table.load_full().ok_or_else(|| {
                    WarpError::InvalidCalibration("no restoration table loaded".into())
                })?;
                // The snapshot carries its own model grid
                let grid = table.output_shape();
                (table, grid)
            }
        };

        let start = Instant::now();
        let output = engine::apply_expecting(frame, &table, expected)?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut stats = self.stats.lock();
        stats.frames += 1;
        stats.last_run_time_ms = elapsed_ms;
        stats.total_run_time_ms += elapsed_ms;

        Ok(output)
    }

    /// Warp table for frames of `shape`, rebuilt if the shape changed
    fn warp_table_for(&self, shape: (usize, usize)) -> Result<Arc<SampleTable>> {
        if let Some(table) = self.warp_table.load_full() {
            if table.input_shape() == shape {
                return Ok(table);
            }
        }

        let mut state = self.rebuild.lock();
        // Another frame may have rebuilt while we waited
        if let Some(table) = self.warp_table.load_full() {
            if table.input_shape() == shape {
                return Ok(table);
            }
        }

        let warp = self.config.read().warp;
        let table = Arc::new(build_from_affine(&warp, shape.0, shape.1)?);
        self.warp_table.store(Some(table.clone()));
        state.frame_shape = Some(shape);
        self.stats.lock().rebuilds += 1;
        info!("Built warp table for {}x{} frames", shape.0, shape.1);

        Ok(table)
    }

    /// Install new transform parameters.
    ///
    /// When a frame shape is already known the table is rebuilt right away;
    /// otherwise the first frame builds it. On error nothing changes.
    pub fn set_transform(&self, transform: TransformConfig) -> Result<()> {
        transform.validate()?;

        let state = self.rebuild.lock();
        let rebuilt = match state.frame_shape {
            Some((w, h)) => Some(Arc::new(build_from_affine(&transform, w, h)?)),
            None => None,
        };

        self.config.write().warp = transform;
        if rebuilt.is_some() {
            self.stats.lock().rebuilds += 1;
        }
        self.warp_table.store(rebuilt);
        info!(
            "Transform updated: angle={:.4} rad, scale=({}, {}), center=({}, {}), {}",
            transform.angle,
            transform.scale_x,
            transform.scale_y,
            transform.center_x,
            transform.center_y,
            transform.interpolation.as_str()
        );
        Ok(())
    }

    /// Install new restoration settings.
    ///
    /// The previous backend workspace and restoration table are dropped;
    /// the next load trigger builds a table for the new settings.
    pub fn set_restoration(&self, restoration: RestorationConfig) {
        let mut state = self.rebuild.lock();
        state.backend.release_workspace();
        state.backend = Box::new(IndexMatrixBackend::new(
            restoration.model,
            restoration.block_size,
        ));
        state.load_valid = false;
        self.restore_table.store(None);
        info!(
            "Restoration set to model {} from {:?}",
            restoration.model, restoration.directory
        );
        self.config.write().restoration = restoration;
    }

    /// Write the calibration "load" control.
    ///
    /// Only a low-to-high transition loads the matrices. The files are
    /// checked before anything else, and the table is rebuilt only when
    /// that check passed. Returns whether a new table was installed; on
    /// error the previously installed table stays in place.
    pub fn set_load(&self, level: bool) -> Result<bool> {
        let mut state = self.rebuild.lock();
        if !state.load_edge.update(level) {
            return Ok(false);
        }

        let restoration = self.config.read().restoration.clone();
        state.load_valid = false;

        if let Err(e) = CalibrationMatrices::check_readable(&restoration.directory, restoration.model) {
            warn!("Calibration load rejected: {}", e);
            return Err(e);
        }
        state.load_valid = true;

        let table = CalibrationMatrices::load(&restoration.directory, restoration.model)
            .and_then(|matrices| {
                state.backend.build_from_index_matrices(
                    matrices,
                    restoration.input_width,
                    restoration.input_height,
                )
            });
        let table = match table {
            Ok(table) => table,
            Err(e) => {
                state.load_valid = false;
                warn!("Calibration load failed: {}", e);
                return Err(e);
            }
        };

        self.restore_table.store(Some(Arc::new(table)));
        self.stats.lock().rebuilds += 1;
        info!(
            "Loaded calibration for {} from {:?}",
            restoration.model, restoration.directory
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Interpolation;
    use crate::element::ElementType;
    use crate::restoration::tests::{transpose_matrices, write_matrices};
    use crate::restoration::DeviceModel;
    use std::f64::consts::PI;
    use std::path::Path;

    fn pipeline(config: Config) -> Pipeline {
        Pipeline::new(Arc::new(RwLock::new(config)))
    }

    fn restore_config(dir: &Path, side: usize) -> Config {
        let mut config = Config::default();
        config.pipeline.mode = PipelineMode::Restore;
        config.restoration = RestorationConfig {
            directory: dir.to_path_buf(),
            model: DeviceModel::Custom { side },
            block_size: 2,
            input_width: side,
            input_height: side,
            load_on_start: false,
        };
        config
    }

    fn half_turn() -> TransformConfig {
        TransformConfig {
            angle: PI,
            center_x: 1,
            center_y: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_warp_is_identity() {
        let pipe = pipeline(Config::default());
        let frame = ImageBuffer::from_vec(4, 4, (0..16u16).collect()).unwrap();
        let out = pipe.process(&frame).unwrap();
        assert_eq!(out, frame);

        let stats = pipe.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.rebuilds, 1);
    }

    #[test]
    fn test_warp_rebuilds_on_shape_change() {
        let pipe = pipeline(Config::default());
        pipe.process(&ImageBuffer::zeros(ElementType::UInt8, 4, 4)).unwrap();
        pipe.process(&ImageBuffer::zeros(ElementType::UInt8, 4, 4)).unwrap();
        assert_eq!(pipe.stats().rebuilds, 1);

        let out = pipe.process(&ImageBuffer::zeros(ElementType::Float32, 6, 2)).unwrap();
        assert_eq!(out.dims(), &[6, 2]);
        assert_eq!(pipe.stats().rebuilds, 2);
        assert_eq!(pipe.current_table().unwrap().input_shape(), (6, 2));
    }

    #[test]
    fn test_set_transform_rebuilds_immediately() {
        let pipe = pipeline(Config::default());
        let frame = ImageBuffer::from_vec(3, 3, (1..=9u8).collect()).unwrap();
        pipe.process(&frame).unwrap();

        pipe.set_transform(half_turn()).unwrap();
        assert_eq!(pipe.current_table().unwrap().input_shape(), (3, 3));

        let out = pipe.process(&frame).unwrap();
        assert_eq!(out.as_slice::<u8>().unwrap(), &[9, 8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(pipe.config().read().warp.angle, PI);
    }

    #[test]
    fn test_invalid_transform_keeps_previous_table() {
        let pipe = pipeline(Config::default());
        pipe.process(&ImageBuffer::zeros(ElementType::Int32, 2, 2)).unwrap();
        let before = pipe.current_table().unwrap();

        let bad = TransformConfig {
            scale_x: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(pipe.set_transform(bad), Err(WarpError::Configuration(_))));
        assert!(Arc::ptr_eq(&before, &pipe.current_table().unwrap()));
        assert_eq!(pipe.config().read().warp.scale_x, 0.0);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let pipe = pipeline(Config::default());
        let line = ImageBuffer::new(vec![5], crate::buffer::BufferData::UInt8(vec![0; 5])).unwrap();
        assert!(matches!(pipe.process(&line), Err(WarpError::Shape(_))));
        assert_eq!(pipe.stats().rejected, 1);
        assert!(pipe.current_table().is_none());
    }

    #[test]
    fn test_restore_requires_load() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = pipeline(restore_config(dir.path(), 4));
        let frame = ImageBuffer::zeros(ElementType::UInt16, 4, 4);
        assert!(matches!(
            pipe.process(&frame),
            Err(WarpError::InvalidCalibration(_))
        ));
    }

    #[test]
    fn test_load_is_edge_triggered() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let pipe = pipeline(restore_config(dir.path(), 4));

        assert!(!pipe.set_load(false).unwrap());
        assert!(pipe.set_load(true).unwrap());
        assert!(pipe.load_valid());
        // Holding the level high does nothing
        assert!(!pipe.set_load(true).unwrap());
        assert_eq!(pipe.stats().rebuilds, 1);

        let frame = ImageBuffer::from_vec(4, 4, (0..16u16).collect()).unwrap();
        let out = pipe.process(&frame).unwrap();
        let expected: Vec<u16> = (0..4)
            .flat_map(|y| (0..4).map(move |x| (x * 4 + y) as u16))
            .collect();
        assert_eq!(out.as_slice::<u16>().unwrap(), &expected[..]);

        assert!(!pipe.set_load(false).unwrap());
        assert!(pipe.set_load(true).unwrap());
        assert_eq!(pipe.stats().rebuilds, 2);
    }

    #[test]
    fn test_failed_load_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let pipe = pipeline(restore_config(dir.path(), 4));
        pipe.set_load(true).unwrap();
        let installed = pipe.current_table().unwrap();

        // Truncate the x matrix and trigger again
        write_matrices(dir.path(), 4, &ix[..10], &iy);
        pipe.set_load(false).unwrap();
        assert!(matches!(
            pipe.set_load(true),
            Err(WarpError::InvalidCalibration(_))
        ));
        assert!(!pipe.load_valid());
        assert!(Arc::ptr_eq(&installed, &pipe.current_table().unwrap()));
    }

    #[test]
    fn test_restore_rejects_wrong_frame_size() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let pipe = pipeline(restore_config(dir.path(), 4));
        pipe.set_load(true).unwrap();

        let frame = ImageBuffer::zeros(ElementType::UInt16, 5, 4);
        assert!(matches!(pipe.process(&frame), Err(WarpError::Shape(_))));
    }

    #[test]
    fn test_set_restoration_drops_table() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let pipe = pipeline(restore_config(dir.path(), 4));
        pipe.set_load(true).unwrap();
        assert!(pipe.current_table().is_some());

        let mut restoration = pipe.config().read().restoration.clone();
        restoration.block_size = 3;
        pipe.set_restoration(restoration);
        assert!(pipe.current_table().is_none());
        assert!(!pipe.load_valid());

        pipe.set_load(false).unwrap();
        assert!(pipe.set_load(true).unwrap());
    }

    #[test]
    fn test_mode_switch_selects_table() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let mut config = restore_config(dir.path(), 4);
        config.pipeline.mode = PipelineMode::Warp;
        let pipe = pipeline(config);

        let frame = ImageBuffer::from_vec(4, 4, (0..16u16).collect()).unwrap();
        assert_eq!(pipe.process(&frame).unwrap(), frame);
        let warp = pipe.current_table().unwrap();
        assert_eq!(warp.samples_per_pixel(), 1);

        assert!(pipe.set_load(true).unwrap());
        // Loading does not change the mode
        assert!(Arc::ptr_eq(&warp, &pipe.current_table().unwrap()));

        pipe.set_mode(PipelineMode::Restore);
        assert_eq!(pipe.mode(), PipelineMode::Restore);
        let restore = pipe.current_table().unwrap();
        assert!(!Arc::ptr_eq(&warp, &restore));

        let out = pipe.process(&frame).unwrap();
        let transposed: Vec<u16> = (0..4)
            .flat_map(|y| (0..4).map(move |x| (x * 4 + y) as u16))
            .collect();
        assert_eq!(out.as_slice::<u16>().unwrap(), &transposed[..]);

        pipe.set_mode(PipelineMode::Warp);
        assert!(Arc::ptr_eq(&warp, &pipe.current_table().unwrap()));
        assert_eq!(pipe.process(&frame).unwrap(), frame);
        assert_eq!(pipe.stats().frames, 3);
    }

    #[test]
    fn test_restore_uses_grid_of_installed_table() {
        let dir = tempfile::tempdir().unwrap();
        let (ix, iy) = transpose_matrices(4);
        write_matrices(dir.path(), 4, &ix, &iy);
        let pipe = pipeline(restore_config(dir.path(), 4));
        pipe.set_load(true).unwrap();
        let installed = pipe.current_table().unwrap();

        // A model change recorded in the config alone must not reject frames
        // still served by the installed table
        pipe.config().write().restoration.model = DeviceModel::Custom { side: 8 };
        let out = pipe.process(&ImageBuffer::zeros(ElementType::UInt16, 4, 4)).unwrap();
        assert_eq!(out.dims(), &[4, 4]);
        assert!(Arc::ptr_eq(&installed, &pipe.current_table().unwrap()));
    }

    #[test]
    fn test_frames_see_consistent_tables() {
        let pipe = pipeline(Config::default());
        let frame = ImageBuffer::from_vec(3, 3, (1..=9u8).collect()).unwrap();
        let identity: Vec<u8> = (1..=9).collect();
        let flipped: Vec<u8> = (1..=9).rev().collect();
        pipe.process(&frame).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..50 {
                    let mut t = if i % 2 == 0 { half_turn() } else { TransformConfig::default() };
                    t.interpolation = Interpolation::Nearest;
                    pipe.set_transform(t).unwrap();
                }
            });
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let out = pipe.process(&frame).unwrap();
                        let values = out.as_slice::<u8>().unwrap();
                        assert!(values == &identity[..] || values == &flipped[..]);
                    }
                });
            }
        });

        assert_eq!(pipe.stats().frames, 201);
    }
}
