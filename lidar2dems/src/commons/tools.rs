use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use crate::error::L2dError;

/// Run an external tool and wait for it.
/// A non-zero exit becomes [`L2dError::ExternalToolFailure`].
pub fn run_tool(command: &mut Command, tool: &str) -> Result<()> {
    log::debug!("Running {:?}", command);
    let status = command.status().with_context(|| {
        format!(
            "Failed to execute {}. Make sure it is installed and in PATH",
            tool
        )
    })?;

    if !status.success() {
        return Err(L2dError::ExternalToolFailure {
            tool: tool.to_string(),
            status: status.code(),
        }
        .into());
    }
    Ok(())
}

/// Make `path` absolute against the current directory, without touching the filesystem
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(path))
}

/// Best-effort removal; missing files are fine
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                log::warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}

/// Request-scoped scratch directory, deleted when the handle drops
pub fn scratch_workspace(parent: &Path, prefix: &str) -> Result<TempDir> {
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create scratch directory {:?}", parent))?;
    tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .with_context(|| format!("Failed to create scratch workspace in {:?}", parent))
}

/// `<dir>/<stem><suffix>.tif` next to `path`
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}.tif", stem, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_path() {
        let abs = absolute_path(Path::new("/data/a.las")).unwrap();
        assert_eq!(abs, PathBuf::from("/data/a.las"));
        let rel = absolute_path(Path::new("a.las")).unwrap();
        assert!(rel.is_absolute());
        assert!(rel.ends_with("a.las"));
    }

    #[test]
    fn test_sibling_with_suffix() {
        assert_eq!(
            sibling_with_suffix(Path::new("/out/DSM_r1.0.max.tif"), "_warp"),
            PathBuf::from("/out/DSM_r1.0.max_warp.tif")
        );
        assert_eq!(
            sibling_with_suffix(Path::new("/out/chm.tif"), "_hillshade"),
            PathBuf::from("/out/chm_hillshade.tif")
        );
    }

    #[test]
    fn test_scratch_workspace_is_removed_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let ws = scratch_workspace(parent.path(), "l2d_").unwrap();
            assert!(ws.path().is_dir());
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_tool() {
        let err = run_tool(&mut Command::new("no-such-raster-tool"), "no-such-raster-tool").unwrap_err();
        assert!(err.downcast_ref::<L2dError>().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool() {
        let err = run_tool(&mut Command::new("false"), "false").unwrap_err();
        match err.downcast_ref::<L2dError>() {
            Some(L2dError::ExternalToolFailure { tool, status }) => {
                assert_eq!(tool, "false");
                assert_eq!(*status, Some(1));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
