//! Raster products derived from point-cloud pipelines.

pub mod chm;
pub mod dem;
pub mod gap_fill;
pub mod hillshade;
pub mod interpolate;
pub mod mosaic;
pub mod raster;
pub mod triangulation;
pub mod warp;

pub use chm::{create_chm, difference};
pub use dem::{Dem, DemBatch, DemFailure, DemProducts, SiteProducts};
pub use gap_fill::{composite, gap_fill, Interpolation};
pub use hillshade::create_hillshade;
pub use mosaic::{group_by_product, MosaicBuilder, ProductKey};
pub use raster::Raster;
pub use warp::{RasterAligner, WarpRequest};
