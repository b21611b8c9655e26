use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::geometric::gap_fill::Interpolation;
use crate::pipeline::{OutputType, PipelineFormat};

/// Mean-neighbour count used by statistical outlier removal
pub const DEFAULT_OUTLIER_MEAN_K: u32 = 20;

/// Tiles with fewer points than this are left out of a run
pub const DEFAULT_MIN_POINTS: u64 = 2;

/// Writer radius used for density images
pub const DEFAULT_DENSITY_RADIUS: f64 = 0.56;

/// Reduction factors for mosaic overviews
pub const DEFAULT_OVERVIEW_LEVELS: [u32; 4] = [2, 4, 8, 16];

/// Tunables shared by every DEM request of a run.
///
/// All fields have defaults, so a JSON file only needs the keys it overrides:
///
/// ```json
/// { "outlier_mean_k": 12, "pipeline_format": "json" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub outlier_mean_k: u32,
    pub min_points: u64,
    pub density_radius: f64,
    pub dsm_outputs: Vec<OutputType>,
    pub dtm_outputs: Vec<OutputType>,
    pub pipeline_format: PipelineFormat,
    pub pdal_command: String,
    pub pdal_verbosity: u8,
    /// Log the serialized pipeline before running it
    pub print_pipeline: bool,
    /// gdalwarp resampling method
    pub resampling: String,
    pub overview_levels: Vec<u32>,
    pub gap_fill_interpolation: Option<Interpolation>,
    /// Where pipeline documents and cutlines are created; system temp dir if unset
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            outlier_mean_k: DEFAULT_OUTLIER_MEAN_K,
            min_points: DEFAULT_MIN_POINTS,
            density_radius: DEFAULT_DENSITY_RADIUS,
            dsm_outputs: vec![OutputType::Max],
            dtm_outputs: vec![OutputType::Min, OutputType::Idw],
            pipeline_format: PipelineFormat::Xml,
            pdal_command: "pdal".to_string(),
            pdal_verbosity: 4,
            print_pipeline: false,
            resampling: "bilinear".to_string(),
            overview_levels: DEFAULT_OVERVIEW_LEVELS.to_vec(),
            gap_fill_interpolation: Some(Interpolation::Nearest),
            scratch_dir: None,
        }
    }
}

impl ProcessingConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        Self::from_json(&text).with_context(|| format!("Invalid configuration file {:?}", path))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse configuration JSON")
    }

    /// Directory for per-request scratch files
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.outlier_mean_k, 20);
        assert_eq!(config.min_points, 2);
        assert_eq!(config.overview_levels, vec![2, 4, 8, 16]);
        assert_eq!(config.dsm_outputs, vec![OutputType::Max]);
        assert_eq!(config.dtm_outputs, vec![OutputType::Min, OutputType::Idw]);
        assert_eq!(config.gap_fill_interpolation, Some(Interpolation::Nearest));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ProcessingConfig::from_json(
            r#"{"outlier_mean_k": 12, "pipeline_format": "json", "dtm_outputs": ["idw"]}"#,
        )
        .unwrap();
        assert_eq!(config.outlier_mean_k, 12);
        assert_eq!(config.pipeline_format, PipelineFormat::Json);
        assert_eq!(config.dtm_outputs, vec![OutputType::Idw]);
        assert_eq!(config.pdal_command, "pdal");
        assert_eq!(config.density_radius, 0.56);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"gap_fill_interpolation": "linear", "min_points": 50}}"#).unwrap();
        let config = ProcessingConfig::from_file(file.path()).unwrap();
        assert_eq!(config.gap_fill_interpolation, Some(Interpolation::Linear));
        assert_eq!(config.min_points, 50);
    }

    #[test]
    fn test_invalid_json() {
        assert!(ProcessingConfig::from_json("{not json").is_err());
    }
}
