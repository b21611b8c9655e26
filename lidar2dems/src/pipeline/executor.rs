use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use super::graph::PipelineGraph;
use super::serialize::{serialize, PipelineFormat};
use crate::commons::tools::{remove_files, run_tool};
use crate::config::ProcessingConfig;
use crate::error::L2dError;

/// Hands a pipeline to the external point-cloud engine (`pdal pipeline`)
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    command: String,
    format: PipelineFormat,
    verbosity: u8,
    print_pipeline: bool,
    scratch_dir: PathBuf,
}

impl PipelineExecutor {
    pub fn new(config: &ProcessingConfig) -> Self {
        PipelineExecutor {
            command: config.pdal_command.clone(),
            format: config.pipeline_format,
            verbosity: config.pdal_verbosity,
            print_pipeline: config.print_pipeline,
            scratch_dir: config.scratch_dir(),
        }
    }

    /// Run the pipeline and return the rasters the writer produced.
    ///
    /// The document goes to a uniquely named temp file that is removed when
    /// this returns. On failure any output the engine left behind is deleted,
    /// so a partial raster is never mistaken for a result.
    pub fn run(&self, graph: &PipelineGraph) -> Result<Vec<PathBuf>> {
        let (_, writer) = graph
            .writer()
            .ok_or_else(|| L2dError::contract("pipeline has no writer"))?;
        let outputs = writer.output_paths();

        let document = serialize(graph, self.format)?;
        if self.print_pipeline {
            log::info!("Pipeline:\n{}", document);
        }

        let mut file = tempfile::Builder::new()
            .prefix("pipeline_")
            .suffix(self.format.extension())
            .tempfile_in(&self.scratch_dir)
            .with_context(|| format!("Failed to create pipeline file in {:?}", self.scratch_dir))?;
        file.write_all(document.as_bytes())
            .context("Failed to write pipeline file")?;
        file.flush().context("Failed to write pipeline file")?;

        let mut command = Command::new(&self.command);
        command
            .arg("pipeline")
            .arg("-i")
            .arg(file.path())
            .arg(format!("-v{}", self.verbosity));

        if let Err(err) = run_tool(&mut command, &self.command) {
            remove_files(&outputs);
            return Err(err);
        }

        let missing: Vec<&PathBuf> = outputs.iter().filter(|p| !p.exists()).collect();
        if !missing.is_empty() {
            remove_files(&outputs);
            anyhow::bail!(
                "{} reported success but did not write {:?}",
                self.command,
                missing
            );
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::builder::{DemType, FilterOptions, PipelineBuilder, PipelineRequest};
    use crate::pipeline::graph::OutputType;

    fn graph(out_base: &std::path::Path) -> PipelineGraph {
        PipelineBuilder::new()
            .build(&PipelineRequest {
                readers: &[PathBuf::from("/data/a.las")],
                demtype: DemType::Dsm,
                radius: 1.0,
                outputs: &[OutputType::Max],
                spatial_ref: "",
                filters: &FilterOptions::default(),
                output_base: out_base,
            })
            .unwrap()
    }

    fn executor(command: &str, scratch: &std::path::Path) -> PipelineExecutor {
        let config = ProcessingConfig {
            pdal_command: command.to_string(),
            scratch_dir: Some(scratch.to_path_buf()),
            ..Default::default()
        };
        PipelineExecutor::new(&config)
    }

    #[test]
    fn test_missing_engine_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor("no-such-point-cloud-engine", dir.path());
        assert!(exec.run(&graph(&dir.path().join("DSM_r1.0"))).is_err());
        // the pipeline document does not outlive the call
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_engine_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("DSM_r1.0");
        let partial = dir.path().join("DSM_r1.0.max.tif");
        std::fs::write(&partial, b"partial").unwrap();

        let err = executor("false", dir.path()).run(&graph(&base)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<L2dError>(),
            Some(L2dError::ExternalToolFailure { .. })
        ));
        assert!(!partial.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_success_without_outputs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("DSM_r1.0");
        assert!(executor("true", dir.path()).run(&graph(&base)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_success_returns_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("DSM_r1.0");
        let out = dir.path().join("DSM_r1.0.max.tif");
        std::fs::write(&out, b"raster").unwrap();
        let outputs = executor("true", dir.path()).run(&graph(&base)).unwrap();
        assert_eq!(outputs, vec![out]);
    }
}
