use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::interpolate::{fill_nearest, fill_triangulated};
use super::raster::{same_value, Raster};
use crate::error::L2dError;
use crate::geo_core::SiteGeometry;

/// How cells that no input covers are filled after compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    Linear,
    Cubic,
}

impl Interpolation {
    /// Interpolate the remaining nodata cells of `raster` in place; returns the number filled
    pub fn fill(self, raster: &mut Raster) -> usize {
        match self {
            Interpolation::Nearest => fill_nearest(raster),
            Interpolation::Linear => fill_triangulated(raster, false),
            Interpolation::Cubic => fill_triangulated(raster, true),
        }
    }
}

/// Priority composite of co-registered rasters.
///
/// The first raster is the base; each following raster only contributes to
/// cells that are still nodata. Cells no input covers are interpolated when
/// `interpolation` is set.
pub fn composite(rasters: &[Raster], interpolation: Option<Interpolation>) -> Result<Raster> {
    let (first, rest) = rasters
        .split_first()
        .ok_or_else(|| L2dError::contract("gap fill needs at least one raster"))?;

    for (i, raster) in rest.iter().enumerate() {
        if !first.same_grid(raster) {
            return Err(L2dError::contract(format!(
                "raster {} ({}x{}) is not on the grid of the first raster ({}x{})",
                i + 1,
                raster.width,
                raster.height,
                first.width,
                first.height
            ))
            .into());
        }
        if !same_value(first.nodata, raster.nodata) {
            return Err(L2dError::contract(format!(
                "raster {} has nodata {} but the first raster has {}",
                i + 1,
                raster.nodata,
                first.nodata
            ))
            .into());
        }
    }

    let mut out = first.clone();
    for raster in rest {
        for (cell, &candidate) in out.data.iter_mut().zip(raster.data.iter()) {
            if same_value(*cell, first.nodata) {
                *cell = candidate;
            }
        }
    }

    if let Some(method) = interpolation {
        let filled = method.fill(&mut out);
        log::debug!("Interpolated {} cells ({:?})", filled, method);
    }
    Ok(out)
}

/// Set every cell whose centre falls outside `site` to nodata
pub fn clip_to_site(mut raster: Raster, site: &SiteGeometry) -> Result<Raster> {
    let envelope = site.envelope()?;
    for row in 0..raster.height {
        for col in 0..raster.width {
            let (x, y) = raster.cell_center(row, col);
            let inside = x >= envelope.min_x
                && x <= envelope.max_x
                && y >= envelope.min_y
                && y <= envelope.max_y
                && site.covers_point(x, y);
            if !inside {
                let idx = raster.index(row, col);
                raster.data[idx] = raster.nodata;
            }
        }
    }
    Ok(raster)
}

/// Composite the raster files in priority order into `fout`.
/// With a site, cells outside it are masked to nodata.
pub fn gap_fill(
    filenames: &[PathBuf],
    fout: &Path,
    site: Option<&SiteGeometry>,
    interpolation: Option<Interpolation>,
) -> Result<PathBuf> {
    if filenames.is_empty() {
        return Err(L2dError::contract("gap fill needs at least one input file").into());
    }
    log::info!("Gap filling {} rasters into {:?}", filenames.len(), fout);

    let rasters = filenames
        .iter()
        .map(|f| Raster::open(f).with_context(|| format!("Failed to read gap fill input {:?}", f)))
        .collect::<Result<Vec<_>>>()?;

    let mut out = composite(&rasters, interpolation)?;
    if let Some(site) = site {
        out = clip_to_site(out, site)?;
    }

    let remaining = out.nodata_count();
    if remaining > 0 {
        log::warn!("{} cells of {:?} remain nodata after gap fill", remaining, fout);
    }
    out.save(fout)
}
