//! Configuration management for ndwarp

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::WarpError;
use crate::restoration::DeviceModel;

/// Sampling used when building a table from an affine transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// One sample, rounded to the nearest source pixel
    #[default]
    Nearest,
    /// Four samples weighted by area
    Bilinear,
}

impl Interpolation {
    pub fn samples_per_pixel(&self) -> usize {
        match self {
            Interpolation::Nearest => 1,
            Interpolation::Bilinear => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Interpolation::Nearest => "nearest",
            Interpolation::Bilinear => "bilinear",
        }
    }
}

/// Rotation and scaling about a center point
///
/// The default is the no-op: a scale factor of 0 means identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TransformConfig {
    /// Rotation angle in radians
    #[serde(default)]
    pub angle: f64,
    #[serde(default)]
    pub scale_x: f64,
    #[serde(default)]
    pub scale_y: f64,
    #[serde(default)]
    pub center_x: i32,
    #[serde(default)]
    pub center_y: i32,
    #[serde(default)]
    pub interpolation: Interpolation,
}

impl TransformConfig {
    pub fn validate(&self) -> Result<(), WarpError> {
        if !self.angle.is_finite() {
            return Err(WarpError::Configuration(format!(
                "rotation angle must be finite, got {}",
                self.angle
            )));
        }
        for (name, value) in [("scale_x", self.scale_x), ("scale_y", self.scale_y)] {
            if !value.is_finite() {
                return Err(WarpError::Configuration(format!(
                    "{} must be finite, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Scale factors with 0 replaced by identity
    pub fn effective_scale(&self) -> (f64, f64) {
        let eff = |s: f64| if s == 0.0 { 1.0 } else { s };
        (eff(self.scale_x), eff(self.scale_y))
    }

    pub fn is_identity(&self) -> bool {
        self.angle == 0.0 && self.effective_scale() == (1.0, 1.0)
    }
}

/// Which table the pipeline applies to incoming frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Affine warp built from `[warp]`
    #[default]
    Warp,
    /// Detector restoration built from calibration matrices
    Restore,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: PipelineMode,
    /// Worker threads for resampling (0 = one per core)
    #[serde(default)]
    pub threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Warp,
            threads: 0,
        }
    }
}

fn default_block_size() -> usize {
    16
}

/// Calibration matrices used by the restoration mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorationConfig {
    /// Directory holding `x<model>.b` and `y<model>.b`
    pub directory: PathBuf,
    pub model: DeviceModel,
    /// Tile edge used while building the table
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Raw detector frame size the matrices index into
    pub input_width: usize,
    pub input_height: usize,
    /// Load the matrices as soon as the pipeline starts
    #[serde(default)]
    pub load_on_start: bool,
}

impl Default for RestorationConfig {
    fn default() -> Self {
        let model = DeviceModel::Pi540D;
        Self {
            directory: PathBuf::from("calibration"),
            model,
            block_size: default_block_size(),
            input_width: model.side(),
            input_height: model.side(),
            load_on_start: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub warp: TransformConfig,

    #[serde(default)]
    pub restoration: RestorationConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transform_is_noop() {
        let cfg = TransformConfig::default();
        assert_eq!(cfg.effective_scale(), (1.0, 1.0));
        assert!(cfg.is_identity());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_non_finite_rejected() {
        let cfg = TransformConfig {
            scale_x: f64::INFINITY,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(WarpError::Configuration(_))));

        let cfg = TransformConfig {
            angle: f64::NAN,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(WarpError::Configuration(_))));
    }

    #[test]
    fn test_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [warp]
            angle = 0.5
            interpolation = "bilinear"

            [restoration]
            directory = "/tmp/cal"
            model = "pi135d"
            input_width = 1536
            input_height = 1536
            "#,
        )
        .unwrap();

        assert_eq!(cfg.pipeline.mode, PipelineMode::Warp);
        assert_eq!(cfg.warp.angle, 0.5);
        assert_eq!(cfg.warp.scale_x, 0.0);
        assert_eq!(cfg.warp.interpolation, Interpolation::Bilinear);
        assert_eq!(cfg.restoration.model, DeviceModel::Pi135D);
        assert_eq!(cfg.restoration.block_size, 16);
        assert!(!cfg.restoration.load_on_start);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ndwarp.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created.pipeline.mode, PipelineMode::Warp);

        let mut cfg = created;
        cfg.pipeline.mode = PipelineMode::Restore;
        cfg.warp.center_x = 12;
        cfg.restoration.model = DeviceModel::Custom { side: 8 };
        cfg.save(&path).unwrap();

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.pipeline.mode, PipelineMode::Restore);
        assert_eq!(reloaded.warp.center_x, 12);
        assert_eq!(reloaded.restoration.model, DeviceModel::Custom { side: 8 });
    }
}
