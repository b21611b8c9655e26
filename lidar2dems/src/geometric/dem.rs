use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::chm::create_chm;
use super::gap_fill::gap_fill;
use super::warp::RasterAligner;
use crate::collect::check_boundaries;
use crate::config::ProcessingConfig;
use crate::error::L2dError;
use crate::geo_core::SiteGeometry;
use crate::pipeline::graph::output_path;
use crate::pipeline::{
    DemType, FilterOptions, OutputType, PipelineBuilder, PipelineExecutor, PipelineRequest,
    PointClass,
};

const DENSITY_OUTPUTS: [OutputType; 1] = [OutputType::Den];

fn elapsed(start: DateTime<Local>) -> String {
    let delta = Local::now() - start;
    format!("{:.1}s", delta.num_milliseconds() as f64 / 1000.0)
}

/// Rasters written for one DEM request
#[derive(Debug, Clone, PartialEq)]
pub struct DemProducts {
    pub demtype: DemType,
    pub radius: f64,
    /// Engine outputs, one per statistic, in request order
    pub rasters: Vec<PathBuf>,
    /// Last output, aligned to the site grid
    pub warped: PathBuf,
}

#[derive(Debug)]
pub struct DemFailure {
    pub demtype: DemType,
    pub radius: f64,
    pub error: anyhow::Error,
}

/// Outcome of a batch: every request either produced rasters or failed on its own
#[derive(Debug, Default)]
pub struct DemBatch {
    pub products: Vec<DemProducts>,
    pub failures: Vec<DemFailure>,
}

impl DemBatch {
    /// Products of one type, smallest radius first
    pub fn of_type(&self, demtype: DemType) -> Vec<&DemProducts> {
        let mut found: Vec<&DemProducts> = self.products.iter().filter(|p| p.demtype == demtype).collect();
        found.sort_by(|a, b| a.radius.total_cmp(&b.radius));
        found
    }
}

#[derive(Debug)]
pub struct SiteProducts {
    /// Point-cloud files that intersect the site
    pub tiles: Vec<PathBuf>,
    pub batch: DemBatch,
    /// Gap-filled terrain model
    pub dtm: PathBuf,
    pub chm: Option<PathBuf>,
}

/// DSM / DTM / density production for one site.
///
/// Each request builds a pipeline, runs it through the point-cloud engine and
/// aligns the result to the site grid. Requests share no mutable state, so a
/// batch may run them in parallel.
#[derive(Debug, Clone)]
pub struct Dem {
    output_path: PathBuf,
    site: SiteGeometry,
    config: ProcessingConfig,
    filters: FilterOptions,
    append_name: Option<String>,
    clip: bool,
}

impl Dem {
    pub fn new(output_path: impl Into<PathBuf>, site: SiteGeometry) -> Self {
        Dem {
            output_path: output_path.into(),
            site,
            config: ProcessingConfig::default(),
            filters: FilterOptions::default(),
            append_name: None,
            clip: false,
        }
    }

    pub fn with_config(mut self, config: ProcessingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_filters(&mut self, filters: FilterOptions) {
        self.filters = filters;
    }

    /// Suffix added to every product name, e.g. a tile or site id
    pub fn set_append_name(&mut self, append_name: Option<String>) {
        self.append_name = append_name;
    }

    /// Cut products to the site polygon instead of its bounding box
    pub fn set_clip(&mut self, clip: bool) {
        self.clip = clip;
    }

    pub fn get_output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn site(&self) -> &SiteGeometry {
        &self.site
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// `<output>/<DEMTYPE>_r<radius>[_<append>]`, before the statistic suffix
    pub fn base_path(&self, demtype: DemType, radius: f64) -> PathBuf {
        self.output_path
            .join(demtype.base_name(radius, self.append_name.as_deref()))
    }

    /// `<output>/<name>[_<append>].tif` for site-level products
    pub fn product_path(&self, name: &str) -> PathBuf {
        let name = match &self.append_name {
            Some(append) => format!("{}_{}.tif", name, append),
            None => format!("{}.tif", name),
        };
        self.output_path.join(name)
    }

    pub fn default_outputs(&self, demtype: DemType) -> &[OutputType] {
        match demtype {
            DemType::Dsm => &self.config.dsm_outputs,
            DemType::Dtm => &self.config.dtm_outputs,
            DemType::Density(_) => &DENSITY_OUTPUTS,
        }
    }

    fn aligner(&self) -> RasterAligner<'_> {
        let mut aligner = RasterAligner::new(&self.site, &self.config);
        aligner.set_clip(self.clip);
        aligner
    }

    fn run_pipeline(
        &self,
        filenames: &[PathBuf],
        demtype: DemType,
        radius: f64,
        outputs: &[OutputType],
        base: &Path,
    ) -> Result<Vec<PathBuf>> {
        let graph = PipelineBuilder::new()
            .with_outlier_mean_k(self.config.outlier_mean_k)
            .build(&PipelineRequest {
                readers: filenames,
                demtype,
                radius,
                outputs,
                spatial_ref: self.site.srs(),
                filters: &self.filters,
                output_base: base,
            })?;
        PipelineExecutor::new(&self.config).run(&graph)
    }

    /// Grid `filenames` into one raster per statistic, then align the last
    /// one to the site. `outputs` defaults to the configured statistics.
    pub fn create_dem(
        &self,
        filenames: &[PathBuf],
        demtype: DemType,
        radius: f64,
        outputs: Option<&[OutputType]>,
    ) -> Result<DemProducts> {
        let start = Local::now();
        let outputs = outputs.unwrap_or_else(|| self.default_outputs(demtype));
        let base = self.base_path(demtype, radius);
        log::info!("Creating {:?} from {} files", base, filenames.len());

        let rasters = self
            .run_pipeline(filenames, demtype, radius, outputs, &base)
            .with_context(|| format!("Failed to create {:?}", base))?;
        let last = rasters
            .last()
            .ok_or_else(|| L2dError::contract("pipeline produced no raster"))?;
        let warped = self.aligner().warp_image(last)?;

        log::info!("Completed {:?} in {}", base, elapsed(start));
        Ok(DemProducts {
            demtype,
            radius,
            rasters,
            warped,
        })
    }

    pub fn create_dsm(&self, filenames: &[PathBuf], radius: f64) -> Result<DemProducts> {
        self.create_dem(filenames, DemType::Dsm, radius, None)
    }

    pub fn create_dtm(&self, filenames: &[PathBuf], radius: f64) -> Result<DemProducts> {
        self.create_dem(filenames, DemType::Dtm, radius, None)
    }

    /// Point density image `pts_<points>.den.tif`. An existing image is reused.
    pub fn create_density_image(&self, filenames: &[PathBuf], points: PointClass) -> Result<PathBuf> {
        let demtype = DemType::Density(points);
        let radius = self.config.density_radius;
        let base = self.base_path(demtype, radius);
        let fout = output_path(&base, OutputType::Den);
        if fout.exists() {
            log::info!("{:?} already exists", fout);
            return Ok(fout);
        }

        let start = Local::now();
        self.run_pipeline(filenames, demtype, radius, &DENSITY_OUTPUTS, &base)
            .with_context(|| format!("Failed to create density image {:?}", fout))?;
        if self.clip {
            self.aligner().warp_image(&fout)?;
        }
        log::info!("Completed {:?} in {}", fout, elapsed(start));
        Ok(fout)
    }

    /// One DSM per `dsm_radii` entry and one DTM per `dtm_radii` entry.
    /// A failed request is logged and recorded; the others still run.
    pub fn create_dems(
        &self,
        filenames: &[PathBuf],
        dsm_radii: &[f64],
        dtm_radii: &[f64],
    ) -> Result<DemBatch> {
        std::fs::create_dir_all(&self.output_path)
            .with_context(|| format!("Failed to create output directory: {:?}", self.output_path))?;

        // concurrent requests must never share an output prefix
        let mut requests: Vec<(DemType, f64)> = Vec::new();
        let mut bases: Vec<PathBuf> = Vec::new();
        for (demtype, radius) in dsm_radii
            .iter()
            .map(|&r| (DemType::Dsm, r))
            .chain(dtm_radii.iter().map(|&r| (DemType::Dtm, r)))
        {
            let base = self.base_path(demtype, radius);
            if bases.contains(&base) {
                log::warn!("Skipping repeated {} request with radius {}", demtype, radius);
                continue;
            }
            bases.push(base);
            requests.push((demtype, radius));
        }

        let create = |&(demtype, radius): &(DemType, f64)| {
            (demtype, radius, self.create_dem(filenames, demtype, radius, None))
        };
        #[cfg(feature = "rayon")]
        let results: Vec<_> = requests.par_iter().map(create).collect();
        #[cfg(not(feature = "rayon"))]
        let results: Vec<_> = requests.iter().map(create).collect();

        let mut batch = DemBatch::default();
        for (demtype, radius, result) in results {
            match result {
                Ok(products) => batch.products.push(products),
                Err(error) => {
                    log::error!("{} with radius {} failed: {:#}", demtype, radius, error);
                    batch.failures.push(DemFailure {
                        demtype,
                        radius,
                        error,
                    });
                }
            }
        }
        Ok(batch)
    }

    /// Composite the aligned DTMs into `DTM[_append].tif`, smallest radius first
    pub fn gap_fill_dtms(&self, products: &[DemProducts]) -> Result<PathBuf> {
        let mut dtms: Vec<&DemProducts> = products.iter().filter(|p| p.demtype == DemType::Dtm).collect();
        dtms.sort_by(|a, b| a.radius.total_cmp(&b.radius));
        let files: Vec<PathBuf> = dtms.iter().map(|p| p.warped.clone()).collect();

        let site = if self.clip { Some(&self.site) } else { None };
        gap_fill(
            &files,
            &self.product_path("DTM"),
            site,
            self.config.gap_fill_interpolation,
        )
    }

    /// Canopy height `CHM[_append].tif` from an aligned DSM and DTM
    pub fn create_chm(&self, dsm: &Path, dtm: &Path) -> Result<PathBuf> {
        create_chm(dtm, dsm, &self.product_path("CHM"))
    }

    /// Full run for the site: select tiles, grid every radius, gap fill the
    /// terrain and derive canopy height from the finest DSM.
    pub fn run(&self, filenames: &[PathBuf], dsm_radii: &[f64], dtm_radii: &[f64]) -> Result<SiteProducts> {
        let start = Local::now();
        let tiles = check_boundaries(filenames, &self.site, self.config.min_points)?;
        if tiles.is_empty() {
            return Err(L2dError::DataQuality {
                path: self.output_path.clone(),
                reason: "no point-cloud file intersects the site".to_string(),
            }
            .into());
        }

        let batch = self.create_dems(&tiles, dsm_radii, dtm_radii)?;
        if batch.of_type(DemType::Dtm).is_empty() {
            anyhow::bail!(
                "No DTM could be created in {:?} ({} failed requests)",
                self.output_path,
                batch.failures.len()
            );
        }
        let dtm = self.gap_fill_dtms(&batch.products)?;

        let chm = match batch.of_type(DemType::Dsm).first() {
            Some(dsm) => Some(self.create_chm(&dsm.warped, &dtm)?),
            None => {
                log::warn!("No DSM available, skipping CHM");
                None
            }
        };

        log::info!(
            "Site done in {}: {} products, {} failures",
            elapsed(start),
            batch.products.len(),
            batch.failures.len()
        );
        Ok(SiteProducts {
            tiles,
            batch,
            dtm,
            chm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::BoundingBox;

    fn site() -> SiteGeometry {
        SiteGeometry::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0).to_polygon(), "EPSG:32613").unwrap()
    }

    fn products(demtype: DemType, radius: f64) -> DemProducts {
        DemProducts {
            demtype,
            radius,
            rasters: vec![],
            warped: PathBuf::from(format!("{}_{}.tif", demtype, radius)),
        }
    }

    #[test]
    fn test_paths() {
        let mut dem = Dem::new("/out", site());
        assert_eq!(dem.base_path(DemType::Dsm, 0.5), PathBuf::from("/out/DSM_r0.5"));
        assert_eq!(dem.product_path("DTM"), PathBuf::from("/out/DTM.tif"));

        dem.set_append_name(Some("plot3".to_string()));
        assert_eq!(dem.base_path(DemType::Dtm, 1.0), PathBuf::from("/out/DTM_r1.0_plot3"));
        assert_eq!(dem.product_path("CHM"), PathBuf::from("/out/CHM_plot3.tif"));
        assert_eq!(
            dem.base_path(DemType::Density(PointClass::Ground), 0.56),
            PathBuf::from("/out/pts_ground")
        );
    }

    #[test]
    fn test_default_outputs() {
        let dem = Dem::new("/out", site());
        assert_eq!(dem.default_outputs(DemType::Dsm), &[OutputType::Max]);
        assert_eq!(dem.default_outputs(DemType::Dtm), &[OutputType::Min, OutputType::Idw]);
        assert_eq!(dem.default_outputs(DemType::Density(PointClass::All)), &[OutputType::Den]);
    }

    #[test]
    fn test_batch_of_type_sorted() {
        let batch = DemBatch {
            products: vec![
                products(DemType::Dtm, 2.0),
                products(DemType::Dsm, 0.5),
                products(DemType::Dtm, 0.5),
            ],
            failures: vec![],
        };
        let radii: Vec<f64> = batch.of_type(DemType::Dtm).iter().map(|p| p.radius).collect();
        assert_eq!(radii, vec![0.5, 2.0]);
    }

    #[test]
    fn test_density_reuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("pts_all.den.tif");
        std::fs::write(&existing, b"").unwrap();
        let dem = Dem::new(dir.path(), site());
        let out = dem.create_density_image(&[], PointClass::All).unwrap();
        assert_eq!(out, existing);
    }

    #[test]
    fn test_failed_requests_do_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessingConfig {
            pdal_command: "false".to_string(),
            scratch_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let dem = Dem::new(dir.path().join("out"), site()).with_config(config);
        let batch = dem
            .create_dems(&[PathBuf::from("tile.las")], &[0.5, 1.0], &[1.0])
            .unwrap();
        assert!(batch.products.is_empty());
        assert_eq!(batch.failures.len(), 3);
        assert!(dir.path().join("out").is_dir());
    }

    #[test]
    fn test_repeated_radii_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessingConfig {
            pdal_command: "false".to_string(),
            scratch_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let dem = Dem::new(dir.path().join("out"), site()).with_config(config);
        let batch = dem
            .create_dems(&[PathBuf::from("tile.las")], &[0.5, 0.5, 1.0], &[1.0, 1.0])
            .unwrap();
        let requested: Vec<(DemType, f64)> = batch.failures.iter().map(|f| (f.demtype, f.radius)).collect();
        assert_eq!(requested.len(), 3);
        assert!(requested.contains(&(DemType::Dsm, 0.5)));
        assert!(requested.contains(&(DemType::Dsm, 1.0)));
        assert!(requested.contains(&(DemType::Dtm, 1.0)));
    }

    #[test]
    fn test_run_without_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let dem = Dem::new(dir.path(), site());
        let err = dem
            .run(&[dir.path().join("missing.las")], &[0.5], &[1.0])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<L2dError>(),
            Some(L2dError::DataQuality { .. })
        ));
    }

    #[test]
    fn test_gap_fill_without_dtm() {
        let dem = Dem::new("/out", site());
        let err = dem.gap_fill_dtms(&[products(DemType::Dsm, 0.5)]).unwrap_err();
        assert!(crate::error::is_contract_violation(&err));
    }
}
