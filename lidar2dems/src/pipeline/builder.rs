use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::graph::{FilterKind, OutputType, PipelineGraph, RangeLimit, Stage, WriterOptions};
use crate::commons::tools::absolute_path;
use crate::config::DEFAULT_OUTLIER_MEAN_K;
use crate::error::L2dError;

/// Grid cell size requested from the writer, in SRS units
pub const GRID_SPACING: f64 = 1.0;

/// Which returns feed a density image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointClass {
    All,
    Ground,
    NonGround,
}

impl PointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointClass::All => "all",
            PointClass::Ground => "ground",
            PointClass::NonGround => "nonground",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemType {
    Dsm,
    Dtm,
    Density(PointClass),
}

impl DemType {
    pub fn name(&self) -> &'static str {
        match self {
            DemType::Dsm => "DSM",
            DemType::Dtm => "DTM",
            DemType::Density(_) => "DEN",
        }
    }

    /// Classification kept by this product: non-ground (class <= 1) for surfaces,
    /// ground (class == 2) for terrain, nothing for an all-points density.
    pub fn classification(&self) -> Option<RangeLimit> {
        match self {
            DemType::Dsm | DemType::Density(PointClass::NonGround) => Some(RangeLimit::Max(1.0)),
            DemType::Dtm | DemType::Density(PointClass::Ground) => Some(RangeLimit::Equals(2.0)),
            DemType::Density(PointClass::All) => None,
        }
    }

    /// Base output name, without directory and statistic suffix:
    /// `<DEMTYPE>_r<radius>[_<appendname>]`, or `pts_<points>` for density.
    pub fn base_name(&self, radius: f64, append_name: Option<&str>) -> String {
        match self {
            DemType::Density(points) => format!("pts_{}", points.as_str()),
            _ => {
                let mut name = format!("{}_r{}", self.name(), format_radius(radius));
                if let Some(append) = append_name {
                    name.push('_');
                    name.push_str(append);
                }
                name
            }
        }
    }
}

impl fmt::Display for DemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Radius as it appears in file names: integral values keep one decimal (`1.0`),
/// others use the shortest exact form (`0.56`).
pub fn format_radius(radius: f64) -> String {
    if radius.is_finite() && radius.fract() == 0.0 {
        format!("{:.1}", radius)
    } else {
        radius.to_string()
    }
}

/// Optional point filters applied ahead of the classification filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOptions {
    /// Standard-deviation multiplier for statistical outlier removal (surface and density only)
    pub outlier_threshold: Option<f64>,
    /// Keep points with `|scan angle| <= max_scan_angle`
    pub max_scan_angle: Option<f64>,
    /// Drop points above this elevation
    pub max_elevation: Option<f64>,
    /// Drop points on the edge of a flight line
    pub exclude_edges: bool,
}

/// Everything one DEM pipeline is built from
#[derive(Debug, Clone)]
pub struct PipelineRequest<'a> {
    pub readers: &'a [PathBuf],
    pub demtype: DemType,
    pub radius: f64,
    pub outputs: &'a [OutputType],
    pub spatial_ref: &'a str,
    pub filters: &'a FilterOptions,
    /// Output prefix, e.g. `/out/DSM_r1.0_tile7`
    pub output_base: &'a Path,
}

/// Builds the reader -> filters -> writer graph for a DEM request
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    outlier_mean_k: u32,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            outlier_mean_k: DEFAULT_OUTLIER_MEAN_K,
        }
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outlier_mean_k(mut self, mean_k: u32) -> Self {
        self.outlier_mean_k = mean_k;
        self
    }

    /// Assemble the pipeline for one request.
    ///
    /// Layout: readers, a merge when there is more than one reader, then
    /// outlier removal, scan angle, max elevation and flight-line edge filters
    /// (each only when asked for), the classification filter, and the writer.
    pub fn build(&self, request: &PipelineRequest<'_>) -> Result<PipelineGraph> {
        if request.readers.is_empty() {
            return Err(L2dError::contract("no point-cloud files given").into());
        }
        if !(request.radius > 0.0) {
            return Err(L2dError::contract(format!("radius must be positive, got {}", request.radius)).into());
        }
        if request.outputs.is_empty() {
            return Err(L2dError::contract("no output statistic requested").into());
        }

        let mut graph = PipelineGraph::new();

        let reader_ids = request
            .readers
            .iter()
            .map(|p| Ok(graph.add_stage(Stage::Reader { path: absolute_path(p)? })))
            .collect::<Result<Vec<_>>>()?;

        let mut head = if reader_ids.len() > 1 {
            let merge = graph.add_stage(Stage::Filter(FilterKind::Merge));
            for &reader in &reader_ids {
                graph.connect(reader, merge);
            }
            merge
        } else {
            reader_ids[0]
        };

        for kind in self.filter_chain(request)? {
            let id = graph.add_stage(Stage::Filter(kind));
            graph.connect(head, id);
            head = id;
        }

        let writer = graph.add_stage(Stage::Writer(WriterOptions {
            filename: absolute_path(request.output_base)?,
            grid_dist_x: GRID_SPACING,
            grid_dist_y: GRID_SPACING,
            radius: request.radius,
            outputs: dedup_outputs(request.outputs),
            spatial_reference: Some(request.spatial_ref)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            output_format: "tif".to_string(),
        }));
        graph.connect(head, writer);

        graph.validate()?;
        Ok(graph)
    }

    fn filter_chain(&self, request: &PipelineRequest<'_>) -> Result<Vec<FilterKind>> {
        let filters = request.filters;
        let mut chain = Vec::new();

        if let Some(threshold) = filters.outlier_threshold {
            if !(threshold > 0.0) {
                return Err(L2dError::contract(format!("outlier threshold must be positive, got {}", threshold)).into());
            }
            if request.demtype == DemType::Dtm {
                log::debug!("Outlier removal is not applied to ground points; ignoring threshold {}", threshold);
            } else {
                chain.push(FilterKind::OutlierRemoval {
                    mean_k: self.outlier_mean_k,
                    multiplier: threshold,
                });
            }
        }
        if let Some(angle) = filters.max_scan_angle {
            chain.push(FilterKind::ScanAngleRange {
                max_abs_angle: angle.abs(),
            });
        }
        if let Some(max_z) = filters.max_elevation {
            chain.push(FilterKind::MaxElevationRange { max_z });
        }
        if filters.exclude_edges {
            chain.push(FilterKind::EdgeOfFlightLineRange);
        }
        if let Some(limit) = request.demtype.classification() {
            chain.push(FilterKind::ClassificationRange(limit));
        }
        Ok(chain)
    }
}

/// Drop repeated statistics, keeping first-seen order
fn dedup_outputs(outputs: &[OutputType]) -> Vec<OutputType> {
    let mut seen = Vec::with_capacity(outputs.len());
    for o in outputs {
        if !seen.contains(o) {
            seen.push(*o);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/data/tile_{}.las", i))).collect()
    }

    fn build(readers: &[PathBuf], demtype: DemType, filters: &FilterOptions) -> Result<PipelineGraph> {
        PipelineBuilder::new().build(&PipelineRequest {
            readers,
            demtype,
            radius: 0.5,
            outputs: &[OutputType::Max],
            spatial_ref: "EPSG:32613",
            filters,
            output_base: Path::new("/out/DSM_r0.5"),
        })
    }

    fn classification(graph: &PipelineGraph) -> Vec<RangeLimit> {
        graph
            .filters()
            .filter_map(|(_, k)| match k {
                FilterKind::ClassificationRange(l) => Some(*l),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_writer_and_merge_count() {
        for n in 1..5 {
            for radius in [0.25, 1.0, 3.5] {
                let readers = paths(n);
                let graph = PipelineBuilder::new()
                    .build(&PipelineRequest {
                        readers: &readers,
                        demtype: DemType::Dtm,
                        radius,
                        outputs: &[OutputType::Min, OutputType::Idw],
                        spatial_ref: "",
                        filters: &FilterOptions::default(),
                        output_base: Path::new("/out/DTM"),
                    })
                    .unwrap();
                assert_eq!(graph.count_writers(), 1);
                assert_eq!(graph.count_merges(), if n > 1 { 1 } else { 0 });
                assert_eq!(graph.readers().count(), n);
            }
        }
    }

    #[test]
    fn test_classification_is_inverted_between_dsm_and_dtm() {
        let readers = paths(1);
        let none = FilterOptions::default();
        let dsm = build(&readers, DemType::Dsm, &none).unwrap();
        let dtm = build(&readers, DemType::Dtm, &none).unwrap();
        assert_eq!(classification(&dsm), vec![RangeLimit::Max(1.0)]);
        assert_eq!(classification(&dtm), vec![RangeLimit::Equals(2.0)]);
    }

    #[test]
    fn test_density_classification() {
        let readers = paths(2);
        let none = FilterOptions::default();
        let all = build(&readers, DemType::Density(PointClass::All), &none).unwrap();
        assert!(classification(&all).is_empty());
        let ground = build(&readers, DemType::Density(PointClass::Ground), &none).unwrap();
        assert_eq!(classification(&ground), vec![RangeLimit::Equals(2.0)]);
        let nonground = build(&readers, DemType::Density(PointClass::NonGround), &none).unwrap();
        assert_eq!(classification(&nonground), vec![RangeLimit::Max(1.0)]);
    }

    #[test]
    fn test_filter_chain_order() {
        let readers = paths(3);
        let filters = FilterOptions {
            outlier_threshold: Some(3.0),
            max_scan_angle: Some(-20.0),
            max_elevation: Some(4000.0),
            exclude_edges: true,
        };
        let graph = PipelineBuilder::new()
            .with_outlier_mean_k(8)
            .build(&PipelineRequest {
                readers: &readers,
                demtype: DemType::Dsm,
                radius: 1.0,
                outputs: &[OutputType::Max],
                spatial_ref: "EPSG:32613",
                filters: &filters,
                output_base: Path::new("/out/DSM_r1.0"),
            })
            .unwrap();

        let order = graph.topological_order().unwrap();
        let kinds: Vec<&Stage> = order.iter().skip(3).take(6).map(|&id| graph.stage(id).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                &Stage::Filter(FilterKind::Merge),
                &Stage::Filter(FilterKind::OutlierRemoval {
                    mean_k: 8,
                    multiplier: 3.0
                }),
                &Stage::Filter(FilterKind::ScanAngleRange { max_abs_angle: 20.0 }),
                &Stage::Filter(FilterKind::MaxElevationRange { max_z: 4000.0 }),
                &Stage::Filter(FilterKind::EdgeOfFlightLineRange),
                &Stage::Filter(FilterKind::ClassificationRange(RangeLimit::Max(1.0))),
            ]
        );
        assert!(matches!(graph.stage(*order.last().unwrap()), Some(Stage::Writer(_))));
    }

    #[test]
    fn test_outlier_skipped_for_dtm() {
        let readers = paths(1);
        let filters = FilterOptions {
            outlier_threshold: Some(2.0),
            ..Default::default()
        };
        let graph = build(&readers, DemType::Dtm, &filters).unwrap();
        assert!(!graph
            .filters()
            .any(|(_, k)| matches!(k, FilterKind::OutlierRemoval { .. })));
    }

    #[test]
    fn test_single_reader_feeds_chain_directly() {
        let readers = paths(1);
        let graph = build(&readers, DemType::Dsm, &FilterOptions::default()).unwrap();
        let (reader, _) = graph.readers().next().unwrap();
        let next = graph.outputs(reader);
        assert_eq!(next.len(), 1);
        assert_eq!(
            graph.stage(next[0]),
            Some(&Stage::Filter(FilterKind::ClassificationRange(RangeLimit::Max(1.0))))
        );
    }

    #[test]
    fn test_writer_options() {
        let readers = paths(1);
        let graph = PipelineBuilder::new()
            .build(&PipelineRequest {
                readers: &readers,
                demtype: DemType::Dtm,
                radius: 2.0,
                outputs: &[OutputType::Min, OutputType::Idw, OutputType::Min],
                spatial_ref: "EPSG:32613",
                filters: &FilterOptions::default(),
                output_base: Path::new("/out/DTM_r2.0"),
            })
            .unwrap();
        let (_, writer) = graph.writer().unwrap();
        assert_eq!(writer.grid_dist_x, 1.0);
        assert_eq!(writer.grid_dist_y, 1.0);
        assert_eq!(writer.radius, 2.0);
        assert_eq!(writer.outputs, vec![OutputType::Min, OutputType::Idw]);
        assert_eq!(writer.spatial_reference.as_deref(), Some("EPSG:32613"));
        assert_eq!(
            writer.output_paths(),
            vec![
                PathBuf::from("/out/DTM_r2.0.min.tif"),
                PathBuf::from("/out/DTM_r2.0.idw.tif")
            ]
        );
    }

    #[test]
    fn test_contract_violations() {
        let none = FilterOptions::default();
        let err = build(&[], DemType::Dsm, &none).unwrap_err();
        assert!(crate::error::is_contract_violation(&err));

        let readers = paths(1);
        for radius in [0.0, -1.0, f64::NAN] {
            let err = PipelineBuilder::new()
                .build(&PipelineRequest {
                    readers: &readers,
                    demtype: DemType::Dsm,
                    radius,
                    outputs: &[OutputType::Max],
                    spatial_ref: "",
                    filters: &none,
                    output_base: Path::new("/out/x"),
                })
                .unwrap_err();
            assert!(crate::error::is_contract_violation(&err));
        }

        let err = PipelineBuilder::new()
            .build(&PipelineRequest {
                readers: &readers,
                demtype: DemType::Dsm,
                radius: 1.0,
                outputs: &[],
                spatial_ref: "",
                filters: &none,
                output_base: Path::new("/out/x"),
            })
            .unwrap_err();
        assert!(crate::error::is_contract_violation(&err));
    }

    #[test]
    fn test_base_names() {
        assert_eq!(DemType::Dsm.base_name(0.5, None), "DSM_r0.5");
        assert_eq!(DemType::Dtm.base_name(1.0, Some("tile7")), "DTM_r1.0_tile7");
        assert_eq!(DemType::Density(PointClass::Ground).base_name(0.56, None), "pts_ground");
        assert_eq!(format_radius(0.56), "0.56");
        assert_eq!(format_radius(3.0), "3.0");
    }
}
