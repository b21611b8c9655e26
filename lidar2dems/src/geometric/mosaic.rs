//! Virtual mosaics of per-tile products.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::commons::tools::{remove_files, run_tool};
use crate::config::ProcessingConfig;
use crate::error::L2dError;
use crate::geo_core::BoundingBox;

fn product_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?:.*_)?(DSM|DTM)_r(\d+(?:\.\d+)?)(?:_[^.]+)?\.([a-z]+)(_warp)?\.tif$").ok()
        })
        .as_ref()
}

/// What a tile raster is, as encoded in its file name:
/// `<DEMTYPE>_r<radius>[_<suffix>].<stat>[_warp].tif`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductKey {
    pub demtype: String,
    pub radius: String,
    pub statistic: String,
    pub warped: bool,
}

impl ProductKey {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = product_pattern()?.captures(name)?;
        Some(ProductKey {
            demtype: caps[1].to_string(),
            radius: caps[2].to_string(),
            statistic: caps[3].to_string(),
            warped: caps.get(4).is_some(),
        })
    }

    /// `<DEMTYPE>_r<radius>.<stat>[_warp].vrt`
    pub fn mosaic_name(&self) -> String {
        format!(
            "{}_r{}.{}{}.vrt",
            self.demtype,
            self.radius,
            self.statistic,
            if self.warped { "_warp" } else { "" }
        )
    }
}

/// Group product rasters by key; files that are not products are skipped
pub fn group_by_product(files: &[PathBuf]) -> BTreeMap<ProductKey, Vec<PathBuf>> {
    let mut groups: BTreeMap<ProductKey, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        match ProductKey::from_path(file) {
            Some(key) => groups.entry(key).or_default().push(file.clone()),
            None => log::debug!("Skipping {:?}: not a DEM product", file),
        }
    }
    for members in groups.values_mut() {
        members.sort();
    }
    groups
}

#[derive(Debug, Clone)]
pub struct MosaicBuilder {
    overview_levels: Vec<u32>,
}

impl MosaicBuilder {
    pub fn new(config: &ProcessingConfig) -> Self {
        MosaicBuilder {
            overview_levels: config.overview_levels.clone(),
        }
    }

    /// Build `fout` as a VRT over `files`, optionally clamped to `bounds`
    /// and with internal overviews. An existing `fout` is returned untouched.
    pub fn create_vrt(
        &self,
        files: &[PathBuf],
        fout: &Path,
        bounds: Option<&BoundingBox>,
        overviews: bool,
    ) -> Result<PathBuf> {
        if fout.exists() {
            log::info!("{:?} already exists", fout);
            return Ok(fout.to_path_buf());
        }
        if files.is_empty() {
            return Err(L2dError::contract(format!("no input files for mosaic {:?}", fout)).into());
        }

        let mut command = Command::new("gdalbuildvrt");
        if let Some(b) = bounds {
            command.arg("-te").args(b.to_extent_args());
        }
        command.arg(fout).args(files);
        if let Err(e) = run_tool(&mut command, "gdalbuildvrt") {
            remove_files(&[fout.to_path_buf()]);
            return Err(e).with_context(|| format!("Failed to build mosaic {:?}", fout));
        }

        if overviews && !self.overview_levels.is_empty() {
            let mut command = Command::new("gdaladdo");
            command
                .arg("-ro")
                .arg(fout)
                .args(self.overview_levels.iter().map(|l| l.to_string()));
            run_tool(&mut command, "gdaladdo")
                .with_context(|| format!("Failed to add overviews to {:?}", fout))?;
        }
        log::info!("Created mosaic {:?} from {} files", fout, files.len());
        Ok(fout.to_path_buf())
    }

    /// Mosaic one product group into `dir/<mosaic name>`
    pub fn build_mosaic(
        &self,
        key: &ProductKey,
        files: &[PathBuf],
        dir: &Path,
        bounds: Option<&BoundingBox>,
        overviews: bool,
    ) -> Result<PathBuf> {
        self.create_vrt(files, &dir.join(key.mosaic_name()), bounds, overviews)
    }

    /// One mosaic per product found among the `.tif` files of `dir`
    pub fn create_vrts(
        &self,
        dir: &Path,
        bounds: Option<&BoundingBox>,
        overviews: bool,
    ) -> Result<Vec<PathBuf>> {
        let pattern = dir.join("*.tif");
        let pattern = pattern
            .to_str()
            .with_context(|| format!("Non UTF-8 directory {:?}", dir))?;
        let files = glob::glob(pattern)
            .with_context(|| format!("Invalid glob pattern {}", pattern))?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    None
                }
            })
            .collect::<Vec<_>>();

        group_by_product(&files)
            .iter()
            .map(|(key, members)| self.build_mosaic(key, members, dir, bounds, overviews))
            .collect()
    }
}
