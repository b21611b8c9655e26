use anyhow::{Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::builder::format_radius;
use super::graph::{FilterKind, PipelineGraph, RangeLimit, Stage, StageId, WriterOptions};
use crate::error::L2dError;

/// Document format handed to the point-cloud engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineFormat {
    /// Nested `<Pipeline>` document, writer at the root
    Xml,
    /// Flat `{"pipeline": [...]}` stage list with explicit `inputs`
    Json,
}

impl PipelineFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PipelineFormat::Xml => ".xml",
            PipelineFormat::Json => ".json",
        }
    }
}

pub fn serialize(graph: &PipelineGraph, format: PipelineFormat) -> Result<String> {
    match format {
        PipelineFormat::Xml => to_pdal_xml(graph),
        PipelineFormat::Json => {
            serde_json::to_string_pretty(&to_pdal_json(graph)?).context("Failed to serialize pipeline JSON")
        }
    }
}

/// Nested XML document. Each element holds its upstream stages as children,
/// so the writer is the outermost stage and readers are the leaves.
pub fn to_pdal_xml(graph: &PipelineGraph) -> Result<String> {
    graph.validate()?;
    let (writer_id, _) = graph
        .writer()
        .ok_or_else(|| L2dError::contract("pipeline has no writer"))?;

    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(
        BytesStart::new("Pipeline").with_attributes([("version", "1.0")]),
    ))?;
    write_xml_stage(&mut writer, graph, writer_id)?;
    writer.write_event(Event::End(BytesEnd::new("Pipeline")))?;

    String::from_utf8(writer.into_inner()).context("Pipeline XML is not valid UTF-8")
}

fn write_xml_stage(writer: &mut Writer<Vec<u8>>, graph: &PipelineGraph, id: StageId) -> Result<()> {
    let stage = graph
        .stage(id)
        .ok_or_else(|| L2dError::contract(format!("missing stage {}", id)))?;
    let element = match stage {
        Stage::Reader { .. } => "Reader",
        Stage::Filter(_) => "Filter",
        Stage::Writer(_) => "Writer",
    };
    // the 1.x XML engine wraps PCL filters in a pclblock
    let type_name = match stage {
        Stage::Filter(FilterKind::OutlierRemoval { .. }) => "filters.pclblock",
        _ => stage.type_name(),
    };
    writer.write_event(Event::Start(
        BytesStart::new(element).with_attributes([("type", type_name)]),
    ))?;

    match stage {
        Stage::Reader { path } => {
            write_xml_option(writer, "filename", &path.to_string_lossy())?;
        }
        Stage::Writer(options) => {
            write_xml_writer_options(writer, options)?;
        }
        Stage::Filter(FilterKind::Merge) => {}
        Stage::Filter(FilterKind::OutlierRemoval { mean_k, multiplier }) => {
            write_xml_option(writer, "json", &pcl_outlier_json(*mean_k, *multiplier).to_string())?;
        }
        Stage::Filter(kind) => {
            if let Some((dimension, limit)) = kind.range() {
                write_xml_range(writer, dimension, limit)?;
            }
        }
    }

    for input in graph.inputs(id) {
        write_xml_stage(writer, graph, input)?;
    }

    writer.write_event(Event::End(BytesEnd::new(element)))?;
    Ok(())
}

fn write_xml_option(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<()> {
    writer
        .create_element("Option")
        .with_attribute(("name", name))
        .write_text_content(BytesText::new(value))?;
    Ok(())
}

fn write_xml_writer_options(writer: &mut Writer<Vec<u8>>, options: &WriterOptions) -> Result<()> {
    write_xml_option(writer, "grid_dist_x", &format_radius(options.grid_dist_x))?;
    write_xml_option(writer, "grid_dist_y", &format_radius(options.grid_dist_y))?;
    write_xml_option(writer, "radius", &format_radius(options.radius))?;
    write_xml_option(writer, "output_format", &options.output_format)?;
    if let Some(srs) = &options.spatial_reference {
        write_xml_option(writer, "spatialreference", srs)?;
    }
    write_xml_option(writer, "filename", &options.filename.to_string_lossy())?;
    for output in &options.outputs {
        write_xml_option(writer, "output_type", output.as_str())?;
    }
    Ok(())
}

/// `<Option name="dimension">Z<Options><Option name="max">..</Option></Options></Option>`
fn write_xml_range(writer: &mut Writer<Vec<u8>>, dimension: &str, limit: RangeLimit) -> Result<()> {
    writer.write_event(Event::Start(
        BytesStart::new("Option").with_attributes([("name", "dimension")]),
    ))?;
    writer.write_event(Event::Text(BytesText::new(dimension)))?;
    writer.write_event(Event::Start(BytesStart::new("Options")))?;
    match limit {
        RangeLimit::Equals(v) => write_xml_option(writer, "equals", &v.to_string())?,
        RangeLimit::Max(v) => write_xml_option(writer, "max", &v.to_string())?,
        RangeLimit::Min(v) => write_xml_option(writer, "min", &v.to_string())?,
        RangeLimit::Between { min, max } => {
            write_xml_option(writer, "max", &max.to_string())?;
            write_xml_option(writer, "min", &min.to_string())?;
        }
    }
    writer.write_event(Event::End(BytesEnd::new("Options")))?;
    writer.write_event(Event::End(BytesEnd::new("Option")))?;
    Ok(())
}

fn pcl_outlier_json(mean_k: u32, multiplier: f64) -> Value {
    json!({
        "pipeline": {
            "name": "Outlier Removal",
            "version": 1.0,
            "filters": [{
                "name": "StatisticalOutlierRemoval",
                "setMeanK": mean_k,
                "setStddevMulThresh": multiplier,
            }]
        }
    })
}

/// `Classification[2:2]`, `Z[:120]`, `ScanAngleRank[-15:15]`
pub fn range_limits(dimension: &str, limit: RangeLimit) -> String {
    let (min, max) = limit.bounds();
    format!(
        "{}[{}:{}]",
        dimension,
        min.map(|v| v.to_string()).unwrap_or_default(),
        max.map(|v| v.to_string()).unwrap_or_default()
    )
}

/// Flat JSON stage list in topological order; every non-reader names its inputs by tag
pub fn to_pdal_json(graph: &PipelineGraph) -> Result<Value> {
    graph.validate()?;
    let order = graph.topological_order()?;
    let tag = |id: StageId| -> String {
        let prefix = match graph.stage(id) {
            Some(Stage::Reader { .. }) => "reader",
            Some(Stage::Filter(FilterKind::Merge)) => "merge",
            Some(Stage::Filter(_)) => "filter",
            Some(Stage::Writer(_)) | None => "writer",
        };
        format!("{}_{}", prefix, id)
    };

    let mut stages = Vec::with_capacity(order.len());
    for id in order {
        let stage = graph
            .stage(id)
            .ok_or_else(|| L2dError::contract(format!("missing stage {}", id)))?;
        let mut obj = Map::new();
        obj.insert("type".into(), json!(stage.type_name()));
        obj.insert("tag".into(), json!(tag(id)));

        match stage {
            Stage::Reader { path } => {
                obj.insert("filename".into(), json!(path.to_string_lossy()));
            }
            Stage::Filter(FilterKind::Merge) => {}
            Stage::Filter(FilterKind::OutlierRemoval { mean_k, multiplier }) => {
                obj.insert("method".into(), json!("statistical"));
                obj.insert("mean_k".into(), json!(mean_k));
                obj.insert("multiplier".into(), json!(multiplier));
            }
            Stage::Filter(kind) => {
                if let Some((dimension, limit)) = kind.range() {
                    obj.insert("limits".into(), json!(range_limits(dimension, limit)));
                }
            }
            Stage::Writer(w) => {
                obj.insert("filename".into(), json!(w.filename.to_string_lossy()));
                obj.insert("grid_dist_x".into(), json!(w.grid_dist_x));
                obj.insert("grid_dist_y".into(), json!(w.grid_dist_y));
                obj.insert("radius".into(), json!(w.radius));
                obj.insert("output_format".into(), json!(w.output_format));
                obj.insert(
                    "output_type".into(),
                    json!(w.outputs.iter().map(|o| o.as_str()).collect::<Vec<_>>()),
                );
                if let Some(srs) = &w.spatial_reference {
                    obj.insert("spatialreference".into(), json!(srs));
                }
            }
        }

        let inputs = graph.inputs(id);
        if !inputs.is_empty() {
            obj.insert(
                "inputs".into(),
                json!(inputs.into_iter().map(tag).collect::<Vec<_>>()),
            );
        }
        stages.push(Value::Object(obj));
    }

    Ok(json!({ "pipeline": stages }))
}
