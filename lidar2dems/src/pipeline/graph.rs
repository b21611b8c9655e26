use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;

use crate::error::L2dError;

/// Index of a stage inside its [`PipelineGraph`]
pub type StageId = usize;

/// Per-cell statistic the gridding writer computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Min,
    Max,
    Mean,
    Idw,
    Den,
    Std,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Min => "min",
            OutputType::Max => "max",
            OutputType::Mean => "mean",
            OutputType::Idw => "idw",
            OutputType::Den => "den",
            OutputType::Std => "std",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "min" => Some(OutputType::Min),
            "max" => Some(OutputType::Max),
            "mean" => Some(OutputType::Mean),
            "idw" => Some(OutputType::Idw),
            "den" => Some(OutputType::Den),
            "std" => Some(OutputType::Std),
            _ => None,
        }
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive bound of a range filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeLimit {
    Equals(f64),
    Max(f64),
    Min(f64),
    Between { min: f64, max: f64 },
}

impl RangeLimit {
    /// (min, max) pair, open ends as `None`
    pub fn bounds(&self) -> (Option<f64>, Option<f64>) {
        match *self {
            RangeLimit::Equals(v) => (Some(v), Some(v)),
            RangeLimit::Max(v) => (None, Some(v)),
            RangeLimit::Min(v) => (Some(v), None),
            RangeLimit::Between { min, max } => (Some(min), Some(max)),
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        let (min, max) = self.bounds();
        min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// Concatenates every inbound stream
    Merge,
    ClassificationRange(RangeLimit),
    /// Statistical outlier removal over `mean_k` neighbours
    OutlierRemoval { mean_k: u32, multiplier: f64 },
    /// Keeps points with `|scan angle| <= max_abs_angle`
    ScanAngleRange { max_abs_angle: f64 },
    /// Drops points flagged as lying on the edge of a flight line
    EdgeOfFlightLineRange,
    MaxElevationRange { max_z: f64 },
}

impl FilterKind {
    /// Dimension name and limit for the filters expressed as a point range
    pub fn range(&self) -> Option<(&'static str, RangeLimit)> {
        match *self {
            FilterKind::ClassificationRange(limit) => Some(("Classification", limit)),
            FilterKind::ScanAngleRange { max_abs_angle } => Some((
                "ScanAngleRank",
                RangeLimit::Between {
                    min: -max_abs_angle,
                    max: max_abs_angle,
                },
            )),
            FilterKind::EdgeOfFlightLineRange => Some(("EdgeOfFlightLine", RangeLimit::Equals(0.0))),
            FilterKind::MaxElevationRange { max_z } => Some(("Z", RangeLimit::Max(max_z))),
            FilterKind::Merge | FilterKind::OutlierRemoval { .. } => None,
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, FilterKind::Merge)
    }
}

/// Options of the gridding writer (the sink of every pipeline)
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Output prefix; the engine appends `.<statistic>.tif`
    pub filename: PathBuf,
    pub grid_dist_x: f64,
    pub grid_dist_y: f64,
    pub radius: f64,
    pub outputs: Vec<OutputType>,
    pub spatial_reference: Option<String>,
    pub output_format: String,
}

impl WriterOptions {
    /// Files the engine writes, one per requested statistic, in request order
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs
            .iter()
            .map(|t| output_path(&self.filename, *t))
            .collect()
    }
}

/// `<prefix>.<statistic>.tif`
pub fn output_path(prefix: &std::path::Path, output: OutputType) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".{}.tif", output));
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Reader { path: PathBuf },
    Filter(FilterKind),
    Writer(WriterOptions),
}

impl Stage {
    /// Engine stage type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Stage::Reader { .. } => "readers.las",
            Stage::Filter(FilterKind::Merge) => "filters.merge",
            Stage::Filter(FilterKind::OutlierRemoval { .. }) => "filters.outlier",
            Stage::Filter(_) => "filters.range",
            Stage::Writer(_) => "writers.p2g",
        }
    }
}

/// Readers, filters and one writer joined by directed edges (upstream -> downstream).
///
/// Built in memory per DEM request, serialized once, then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineGraph {
    stages: Vec<Stage>,
    edges: Vec<(StageId, StageId)>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, stage: Stage) -> StageId {
        self.stages.push(stage);
        self.stages.len() - 1
    }

    /// Feed the output of `from` into `to`
    pub fn connect(&mut self, from: StageId, to: StageId) {
        self.edges.push((from, to));
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn edges(&self) -> &[(StageId, StageId)] {
        &self.edges
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id)
    }

    /// Upstream stages of `id`, in the order they were connected
    pub fn inputs(&self, id: StageId) -> Vec<StageId> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == id)
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn outputs(&self, id: StageId) -> Vec<StageId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn writer(&self) -> Option<(StageId, &WriterOptions)> {
        self.stages.iter().enumerate().find_map(|(id, s)| match s {
            Stage::Writer(w) => Some((id, w)),
            _ => None,
        })
    }

    pub fn readers(&self) -> impl Iterator<Item = (StageId, &PathBuf)> {
        self.stages.iter().enumerate().filter_map(|(id, s)| match s {
            Stage::Reader { path } => Some((id, path)),
            _ => None,
        })
    }

    pub fn filters(&self) -> impl Iterator<Item = (StageId, &FilterKind)> {
        self.stages.iter().enumerate().filter_map(|(id, s)| match s {
            Stage::Filter(kind) => Some((id, kind)),
            _ => None,
        })
    }

    pub fn count_writers(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, Stage::Writer(_)))
            .count()
    }

    pub fn count_merges(&self) -> usize {
        self.filters().filter(|(_, k)| k.is_merge()).count()
    }

    /// Stages ordered so that every stage comes after all of its inputs.
    /// Fails if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<StageId>> {
        let mut in_degree = vec![0usize; self.stages.len()];
        for &(from, to) in &self.edges {
            if from >= self.stages.len() || to >= self.stages.len() {
                return Err(L2dError::contract(format!("edge {}->{} names a missing stage", from, to)).into());
            }
            in_degree[to] += 1;
        }

        let mut ready: VecDeque<StageId> = (0..self.stages.len()).filter(|&id| in_degree[id] == 0).collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            for next in self.outputs(id) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != self.stages.len() {
            return Err(L2dError::contract("pipeline graph contains a cycle").into());
        }
        Ok(order)
    }

    /// Check the structural invariants: a single writer sink, readers as pure
    /// sources, merges with at least two inputs, every other filter with exactly
    /// one, each non-sink feeding exactly one stage, no cycle.
    pub fn validate(&self) -> Result<()> {
        let writers = self.count_writers();
        if writers != 1 {
            return Err(L2dError::contract(format!("pipeline must have exactly one writer, found {}", writers)).into());
        }
        if self.readers().next().is_none() {
            return Err(L2dError::contract("pipeline has no reader").into());
        }

        for (id, stage) in self.stages.iter().enumerate() {
            let n_in = self.inputs(id).len();
            let n_out = self.outputs(id).len();
            let ok_in = match stage {
                Stage::Reader { .. } => n_in == 0,
                Stage::Filter(FilterKind::Merge) => n_in >= 2,
                Stage::Filter(_) | Stage::Writer(_) => n_in == 1,
            };
            if !ok_in {
                return Err(L2dError::contract(format!(
                    "stage {} ({}) has {} inputs",
                    id,
                    stage.type_name(),
                    n_in
                ))
                .into());
            }
            let ok_out = match stage {
                Stage::Writer(_) => n_out == 0,
                _ => n_out == 1,
            };
            if !ok_out {
                return Err(L2dError::contract(format!(
                    "stage {} ({}) feeds {} stages",
                    id,
                    stage.type_name(),
                    n_out
                ))
                .into());
            }
        }

        // with one outbound edge per non-sink, acyclic means everything drains into the writer
        self.topological_order()?;
        Ok(())
    }
}
