use anyhow::{Context, Result};
use gdal::Dataset;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::commons::tools::{remove_files, run_tool, scratch_workspace, sibling_with_suffix};
use crate::config::ProcessingConfig;
use crate::geo_core::{align_bounds, BoundingBox, SiteGeometry};

/// Suffix added to the stem of warped rasters
pub const WARP_SUFFIX: &str = "_warp";

/// One `gdalwarp` invocation
#[derive(Debug, Clone, PartialEq)]
pub struct WarpRequest<'a> {
    pub src: &'a Path,
    pub dst: &'a Path,
    pub extent: BoundingBox,
    pub srs: &'a str,
    pub nodata: Option<f64>,
    pub resampling: &'a str,
    pub cutline: Option<&'a Path>,
}

impl WarpRequest<'_> {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![self.src.into(), self.dst.into(), "-te".into()];
        args.extend(self.extent.to_extent_args().into_iter().map(OsString::from));
        if let Some(nodata) = self.nodata {
            args.push("-dstnodata".into());
            args.push(nodata.to_string().into());
        }
        args.extend(["-t_srs", self.srs, "-r", self.resampling, "-overwrite"].map(OsString::from));
        if let Some(cutline) = self.cutline {
            args.push("-cutline".into());
            args.push(cutline.into());
            args.push("-crop_to_cutline".into());
        }
        args
    }

    pub fn run(&self) -> Result<PathBuf> {
        let mut command = Command::new("gdalwarp");
        command.args(self.args());
        if let Err(e) = run_tool(&mut command, "gdalwarp") {
            remove_files(&[self.dst.to_path_buf()]);
            return Err(e).with_context(|| format!("Failed to warp {:?}", self.src));
        }
        Ok(self.dst.to_path_buf())
    }
}

fn band_nodata(path: &Path) -> Result<Option<f64>> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open raster {:?}", path))?;
    let band = dataset
        .rasterband(1)
        .with_context(|| format!("Failed to get band 1 of {:?}", path))?;
    Ok(band.no_data_value())
}

/// Bring a raster onto the site grid: integer-snapped site bounds, site
/// SRS, bilinear resampling. With `clip`, cells outside the site polygon
/// are cut away too.
///
/// Writes `<stem>_warp.tif` (or the given suffix) next to the input.
#[derive(Debug, Clone)]
pub struct RasterAligner<'a> {
    site: &'a SiteGeometry,
    resampling: String,
    scratch_dir: PathBuf,
    suffix: String,
    clip: bool,
}

impl<'a> RasterAligner<'a> {
    pub fn new(site: &'a SiteGeometry, config: &ProcessingConfig) -> Self {
        RasterAligner {
            site,
            resampling: config.resampling.clone(),
            scratch_dir: config.scratch_dir(),
            suffix: WARP_SUFFIX.to_string(),
            clip: false,
        }
    }

    pub fn set_suffix(&mut self, suffix: &str) {
        self.suffix = suffix.to_string();
    }

    pub fn set_clip(&mut self, clip: bool) {
        self.clip = clip;
    }

    pub fn output_path(&self, filename: &Path) -> PathBuf {
        sibling_with_suffix(filename, &self.suffix)
    }

    pub fn warp_image(&self, filename: &Path) -> Result<PathBuf> {
        let extent = align_bounds(self.site)?;
        let dst = self.output_path(filename);
        log::info!("Warping {:?} to {:?}", filename, dst);

        // cutline lives only as long as this call
        let workspace = if self.clip {
            Some(scratch_workspace(&self.scratch_dir, "cutline_")?)
        } else {
            None
        };
        let cutline = match &workspace {
            Some(dir) => Some(self.site.write_cutline(dir.path())?),
            None => None,
        };
        let nodata = band_nodata(filename)?;

        WarpRequest {
            src: filename,
            dst: &dst,
            extent,
            srs: self.site.srs(),
            nodata,
            resampling: &self.resampling,
            cutline: cutline.as_deref(),
        }
        .run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> SiteGeometry {
        SiteGeometry::new(BoundingBox::new(10.2, 5.7, 20.1, 9.9).to_polygon(), "EPSG:32613").unwrap()
    }

    #[test]
    fn test_args_without_cutline() {
        let request = WarpRequest {
            src: Path::new("in.tif"),
            dst: Path::new("in_warp.tif"),
            extent: BoundingBox::new(10.0, 5.0, 21.0, 10.0),
            srs: "EPSG:32613",
            nodata: Some(-9999.0),
            resampling: "bilinear",
            cutline: None,
        };
        let args: Vec<String> = request.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "in.tif", "in_warp.tif", "-te", "10", "5", "21", "10", "-dstnodata", "-9999", "-t_srs",
                "EPSG:32613", "-r", "bilinear", "-overwrite"
            ]
        );
    }

    #[test]
    fn test_args_with_cutline() {
        let request = WarpRequest {
            src: Path::new("in.tif"),
            dst: Path::new("out.tif"),
            extent: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            srs: "EPSG:4326",
            nodata: None,
            resampling: "near",
            cutline: Some(Path::new("/tmp/site.gpkg")),
        };
        let args: Vec<String> = request.args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(!args.contains(&"-dstnodata".to_string()));
        assert_eq!(&args[args.len() - 3..], ["-cutline", "/tmp/site.gpkg", "-crop_to_cutline"]);
    }

    #[test]
    fn test_output_path() {
        let site = site();
        let mut aligner = RasterAligner::new(&site, &ProcessingConfig::default());
        assert_eq!(
            aligner.output_path(Path::new("/data/DSM_r0.5.max.tif")),
            PathBuf::from("/data/DSM_r0.5.max_warp.tif")
        );
        aligner.set_suffix("_site");
        assert_eq!(
            aligner.output_path(Path::new("/data/DTM_r1.0.idw.tif")),
            PathBuf::from("/data/DTM_r1.0.idw_site.tif")
        );
    }

    #[test]
    fn test_missing_input() {
        let site = site();
        let aligner = RasterAligner::new(&site, &ProcessingConfig::default());
        assert!(aligner.warp_image(Path::new("/nonexistent/in.tif")).is_err());
    }

    #[test]
    fn test_failed_clip_removes_cutline() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessingConfig {
            scratch_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let site = site();
        let mut aligner = RasterAligner::new(&site, &config);
        aligner.set_clip(true);
        assert!(aligner.warp_image(&dir.path().join("missing.tif")).is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("cutline_"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
