use anyhow::Result;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::commons::tools::{remove_files, run_tool, sibling_with_suffix};

/// Shaded relief of a DEM via `gdaldem hillshade`, written to `<stem>_hillshade.tif`
pub fn create_hillshade(filename: &Path) -> Result<PathBuf> {
    let fout = hillshade_path(filename);
    log::info!("Creating hillshade {:?}", fout);
    let mut command = Command::new("gdaldem");
    command.arg("hillshade").arg(filename).arg(&fout);
    if let Err(e) = run_tool(&mut command, "gdaldem") {
        remove_files(&[fout]);
        return Err(e);
    }
    Ok(fout)
}

pub fn hillshade_path(filename: &Path) -> PathBuf {
    sibling_with_suffix(filename, "_hillshade")
}
