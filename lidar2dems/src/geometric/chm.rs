use anyhow::{Context, Result};
use gdal::spatial_ref::SpatialRef;
use std::path::{Path, PathBuf};

use super::raster::Raster;
use crate::error::L2dError;

fn same_projection(a: &str, b: &str) -> Result<bool> {
    if a == b || a.is_empty() || b.is_empty() {
        return Ok(true);
    }
    let a = SpatialRef::from_wkt(a).context("Invalid DSM projection")?;
    let b = SpatialRef::from_wkt(b).context("Invalid DTM projection")?;
    Ok(a == b)
}

/// Canopy height: DSM minus DTM, cell for cell.
///
/// Output takes the DTM nodata value wherever either surface is missing.
pub fn difference(dsm: &Raster, dtm: &Raster) -> Result<Raster> {
    if !dsm.same_grid(dtm) {
        return Err(L2dError::contract(format!(
            "DSM ({}x{}) and DTM ({}x{}) are not on the same grid",
            dsm.width, dsm.height, dtm.width, dtm.height
        ))
        .into());
    }
    if !same_projection(&dsm.projection, &dtm.projection)? {
        return Err(L2dError::contract("DSM and DTM have different spatial references").into());
    }

    let mut chm = Raster::filled_like(dtm, dtm.nodata);
    for (i, cell) in chm.data.iter_mut().enumerate() {
        let (top, ground) = (dsm.data[i], dtm.data[i]);
        if dtm.is_nodata(top) || dtm.is_nodata(ground) || dsm.is_nodata(top) {
            continue;
        }
        *cell = top - ground;
    }
    Ok(chm)
}

/// Write `dsm - dtm` to `fout`, on the DTM grid
pub fn create_chm(dtm: &Path, dsm: &Path, fout: &Path) -> Result<PathBuf> {
    log::info!("Creating CHM {:?} from {:?} and {:?}", fout, dsm, dtm);
    let dtm_raster = Raster::open(dtm)?;
    let dsm_raster = Raster::open(dsm)?;
    difference(&dsm_raster, &dtm_raster)?.save(fout)
}
