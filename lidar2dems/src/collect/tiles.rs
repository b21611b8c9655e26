use anyhow::{Context, Result};
use gdal::vector::LayerAccess;
use gdal::Dataset;
use geo::{Geometry as GeoGeometry, MultiPolygon, Polygon};
use geos::{Geom, Geometry as GeosGeometry};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::L2dError;
use crate::geo_core::{BoundingBox, SiteGeometry};

/// Field of a tile index holding the point-cloud file of each footprint
pub const TILE_INDEX_FIELD: &str = "las_file";

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Header-level summary of a LAS/LAZ file
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudMetadata {
    pub path: PathBuf,
    pub bounds: BoundingBox,
    pub count: u64,
}

impl PointCloudMetadata {
    /// Read extent and point count from the file header; no points are decoded
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open point cloud {:?}", path))?;
        let reader = las::Reader::new(BufReader::new(file))
            .map_err(|e| anyhow::anyhow!("Failed to read LAS header of {:?}: {}", path, e))?;
        let header = reader.header();
        let b = header.bounds();
        Ok(PointCloudMetadata {
            path: path.to_path_buf(),
            bounds: BoundingBox::new(b.min.x, b.min.y, b.max.x, b.max.y),
            count: header.number_of_points(),
        })
    }

    /// Footprint polygon; files with fewer than `min_points` points have none
    pub fn footprint(&self, min_points: u64) -> Result<Polygon<f64>> {
        if self.count < min_points {
            return Err(L2dError::DataQuality {
                path: self.path.clone(),
                reason: format!("{} points, at least {} required", self.count, min_points),
            }
            .into());
        }
        Ok(self.bounds.to_polygon())
    }
}

fn intersection_area(site: &GeosGeometry, footprint: &Polygon<f64>) -> Result<f64> {
    let footprint: GeosGeometry = footprint
        .clone()
        .try_into()
        .context("Failed to convert tile footprint to GEOS")?;
    let overlap = site
        .intersection(&footprint)
        .context("Failed to intersect tile with site")?;
    overlap.area().context("Failed to compute intersection area")
}

/// Keep the tiles whose footprint shares a positive area with the site.
/// Tiles that only touch the site boundary are left out.
pub fn filter_by_intersection(
    tiles: &[(PathBuf, Polygon<f64>)],
    site: &SiteGeometry,
) -> Result<Vec<PathBuf>> {
    let site_geos = site.to_geos()?;
    Ok(select_overlapping(tiles, |footprint| intersection_area(&site_geos, footprint)))
}

/// Tiles whose overlap area is positive. A tile whose area cannot be
/// computed is logged and left out.
fn select_overlapping<F>(tiles: &[(PathBuf, Polygon<f64>)], area: F) -> Vec<PathBuf>
where
    F: Fn(&Polygon<f64>) -> Result<f64>,
{
    let mut kept = Vec::new();
    for (path, footprint) in tiles {
        match area(footprint) {
            Ok(a) if a > 0.0 => kept.push(path.clone()),
            Ok(_) => {}
            Err(e) => log::warn!("Skipping {:?}: {:#}", path, e),
        }
    }
    kept
}

/// Point-cloud files that overlap the site.
///
/// Unreadable files and files with too few points are logged and skipped;
/// they never abort the selection.
pub fn check_boundaries(
    filenames: &[PathBuf],
    site: &SiteGeometry,
    min_points: u64,
) -> Result<Vec<PathBuf>> {
    log::info!("Checking {} files for overlap with the site", filenames.len());

    #[cfg(feature = "indicatif")]
    let pb = {
        let pb = ProgressBar::new(filenames.len() as u64);
        pb.set_style(progress_style());
        pb.set_message("Tiles");
        pb
    };

    let mut tiles = Vec::with_capacity(filenames.len());
    for path in filenames {
        let footprint = PointCloudMetadata::read(path).and_then(|meta| meta.footprint(min_points));
        match footprint {
            Ok(polygon) => tiles.push((path.clone(), polygon)),
            Err(e) => log::warn!("Skipping {:?}: {:#}", path, e),
        }
        #[cfg(feature = "indicatif")]
        pb.inc(1);
    }
    #[cfg(feature = "indicatif")]
    pb.finish_and_clear();

    let kept = filter_by_intersection(&tiles, site)?;
    log::info!("{} of {} files intersect the site", kept.len(), filenames.len());
    Ok(kept)
}

#[derive(Debug, Clone)]
pub struct TileEntry {
    pub path: PathBuf,
    pub footprint: MultiPolygon<f64>,
}

/// Footprints of point-cloud tiles, usually read from a vector tile index
#[derive(Debug, Clone, Default)]
pub struct TileIndex {
    entries: Vec<TileEntry>,
}

impl TileIndex {
    pub fn new(entries: Vec<TileEntry>) -> Self {
        TileIndex { entries }
    }

    pub fn entries(&self) -> &[TileEntry] {
        &self.entries
    }

    pub fn push(&mut self, path: impl Into<PathBuf>, footprint: impl Into<MultiPolygon<f64>>) {
        self.entries.push(TileEntry {
            path: path.into(),
            footprint: footprint.into(),
        });
    }

    /// Read every feature of the first layer of `path`; `field` names the
    /// point-cloud file of each footprint. Relative file names are taken
    /// relative to the index file.
    pub fn from_vector_file(path: impl AsRef<Path>, field: &str) -> Result<Self> {
        let path = path.as_ref();
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let dataset =
            Dataset::open(path).with_context(|| format!("Failed to open tile index {:?}", path))?;
        let mut layer = dataset
            .layer(0)
            .with_context(|| format!("No layer in tile index {:?}", path))?;

        let mut index = TileIndex::default();
        for (i, feature) in layer.features().enumerate() {
            let field_idx = feature
                .field_index(field)
                .with_context(|| format!("Tile index {:?} has no field {}", path, field))?;
            let Some(file) = feature.field_as_string(field_idx)? else {
                log::warn!("Feature #{} of {:?} has an empty {} field", i, path, field);
                continue;
            };
            let Some(geometry) = feature.geometry() else {
                log::warn!("Feature #{} of {:?} has no geometry", i, path);
                continue;
            };
            let wkt = geometry.wkt().context("Failed to get WKT from GDAL geometry")?;
            let footprint: GeoGeometry<f64> = GeosGeometry::new_from_wkt(&wkt)
                .context("Failed to parse tile footprint")?
                .try_into()
                .context("Failed to convert tile footprint to geo")?;
            match footprint {
                GeoGeometry::Polygon(p) => index.push(base.join(file), p),
                GeoGeometry::MultiPolygon(mp) => index.push(base.join(file), mp),
                _ => log::warn!("Feature #{} of {:?} is not polygonal", i, path),
            }
        }
        log::debug!("Read {} tiles from {:?}", index.entries.len(), path);
        Ok(index)
    }
}

/// Tiles of the index whose footprint intersects or touches the site
pub fn filter_by_tile_index(site: &SiteGeometry, index: &TileIndex) -> Result<Vec<PathBuf>> {
    let site_geos = site.to_geos()?;
    let mut kept = Vec::new();
    for entry in index.entries() {
        let footprint: GeosGeometry = entry
            .footprint
            .clone()
            .try_into()
            .context("Failed to convert tile footprint to GEOS")?;
        let distance = site_geos
            .distance(&footprint)
            .context("Failed to compute tile distance")?;
        if distance == 0.0 {
            kept.push(entry.path.clone());
        }
    }
    Ok(kept)
}

/// Point-cloud files listed in the tile index file `index_path` that touch or overlap the site
pub fn check_overlap(site: &SiteGeometry, index_path: &Path) -> Result<Vec<PathBuf>> {
    let index = TileIndex::from_vector_file(index_path, TILE_INDEX_FIELD)?;
    let kept = filter_by_tile_index(site, &index)?;
    log::info!("{} of {} indexed tiles overlap the site", kept.len(), index.entries().len());
    Ok(kept)
}
