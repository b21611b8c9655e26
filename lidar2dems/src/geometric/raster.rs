use anyhow::{Context, Result};
use gdal::raster::Buffer;
use gdal::Dataset;
use std::path::{Path, PathBuf};

use crate::error::L2dError;

/// Nodata used when a file carries no sentinel of its own
pub const DEFAULT_NODATA: f64 = -9999.0;

/// Single-band gridded surface held in memory (row-major, north-up).
///
/// Every transform in this crate reads one or more rasters and returns a new
/// one; inputs are never modified in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    /// GDAL-style transform: [x_origin, pixel_width, 0, y_origin, 0, -pixel_height]
    pub transform: [f64; 6],
    /// Spatial reference as WKT (may be empty)
    pub projection: String,
    pub nodata: f64,
    pub data: Vec<f64>,
}

impl Raster {
    pub fn new(
        width: usize,
        height: usize,
        transform: [f64; 6],
        projection: impl Into<String>,
        nodata: f64,
        data: Vec<f64>,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(L2dError::contract(format!(
                "raster of {}x{} needs {} cells, got {}",
                width,
                height,
                width * height,
                data.len()
            ))
            .into());
        }
        Ok(Raster {
            width,
            height,
            transform,
            projection: projection.into(),
            nodata,
            data,
        })
    }

    /// Raster of the same grid, every cell set to `value`
    pub fn filled_like(other: &Raster, value: f64) -> Self {
        Raster {
            data: vec![value; other.data.len()],
            ..other.clone()
        }
    }

    /// Read band 1 of a raster file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let dataset = Dataset::open(path).with_context(|| format!("Failed to open raster {:?}", path))?;
        let (width, height) = dataset.raster_size();
        let transform = dataset
            .geo_transform()
            .with_context(|| format!("Raster {:?} has no geotransform", path))?;
        let projection = dataset.projection();

        let band = dataset
            .rasterband(1)
            .with_context(|| format!("Failed to get band 1 of {:?}", path))?;
        let nodata = band.no_data_value().unwrap_or_else(|| {
            log::warn!("{:?} has no nodata value, assuming {}", path, DEFAULT_NODATA);
            DEFAULT_NODATA
        });
        let buffer = band
            .read_as::<f64>((0, 0), (width, height), (width, height), None)
            .with_context(|| format!("Failed to read band 1 of {:?}", path))?;
        let (_, data) = buffer.into_shape_and_vec();

        Raster::new(width, height, transform, projection, nodata, data)
    }

    /// Write as a single-band Float64 GeoTIFF, replacing any existing file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create output directory: {:?}", parent))?;
        }
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove existing file: {:?}", path))?;
        }

        let driver = gdal::DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;
        let mut dataset = driver
            .create_with_band_type::<f64, _>(path, self.width, self.height, 1)
            .with_context(|| format!("Failed to create GeoTIFF {:?}", path))?;
        dataset
            .set_geo_transform(&self.transform)
            .context("Failed to set geotransform")?;
        if !self.projection.is_empty() {
            dataset
                .set_projection(&self.projection)
                .context("Failed to set spatial reference")?;
        }

        let mut band = dataset.rasterband(1).context("Failed to get output band")?;
        band.set_no_data_value(Some(self.nodata))
            .context("Failed to set no data value")?;
        let mut buffer = Buffer::new((self.width, self.height), self.data.clone());
        band.write((0, 0), (self.width, self.height), &mut buffer)
            .context("Failed to write raster band")?;

        Ok(path.to_path_buf())
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[self.index(row, col)]
    }

    /// Nodata test that also works for a NaN sentinel
    pub fn is_nodata(&self, value: f64) -> bool {
        same_value(value, self.nodata)
    }

    pub fn nodata_count(&self) -> usize {
        self.data.iter().filter(|&&v| self.is_nodata(v)).count()
    }

    /// Map coordinates of the centre of a cell
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let t = &self.transform;
        let c = col as f64 + 0.5;
        let r = row as f64 + 0.5;
        (t[0] + c * t[1] + r * t[2], t[3] + c * t[4] + r * t[5])
    }

    /// Same size and geotransform
    pub fn same_grid(&self, other: &Raster) -> bool {
        self.width == other.width
            && self.height == other.height
            && self
                .transform
                .iter()
                .zip(other.transform.iter())
                .all(|(a, b)| (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0))
    }
}

/// Equality where NaN matches NaN
pub fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}
