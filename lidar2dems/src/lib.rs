//! Digital elevation models from classified lidar point clouds.
//!
//! Point-cloud tiles are gridded through PDAL pipelines into surface (DSM),
//! terrain (DTM) and density rasters, aligned to a site grid with GDAL, then
//! composited into gap-free terrain, canopy height and tile mosaics.

pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod geometric;
pub mod pipeline;

pub use config::ProcessingConfig;
pub use error::L2dError;
pub use geo_core::{align_bounds, BoundingBox, SiteGeometry};
pub use geometric::Dem;
