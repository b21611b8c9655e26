//! Point-cloud pipelines: an explicit reader/filter/writer graph, its
//! serialized forms, and the adapter that runs it through the engine.

pub mod builder;
pub mod executor;
pub mod graph;
pub mod serialize;

pub use builder::{format_radius, DemType, FilterOptions, PipelineBuilder, PipelineRequest, PointClass};
pub use executor::PipelineExecutor;
pub use graph::{FilterKind, OutputType, PipelineGraph, RangeLimit, Stage, StageId, WriterOptions};
pub use serialize::PipelineFormat;
