use std::path::PathBuf;

/// Error taxonomy for DEM production.
///
/// Functions in this crate return `anyhow::Result`; the variants below are
/// wrapped inside the `anyhow::Error` so callers can classify a failure with
/// `err.downcast_ref::<L2dError>()`.
#[derive(Debug, thiserror::Error)]
pub enum L2dError {
    /// Invalid caller input, raised before any external process is started
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// An external engine or raster tool exited with a non-zero status
    #[error("{tool} failed with {}", status.map(|c| format!("exit status {}", c)).unwrap_or_else(|| "no exit status".to_string()))]
    ExternalToolFailure { tool: String, status: Option<i32> },

    /// A tile rejected from a batch (too few points, unreadable header, no overlap)
    #[error("{}: {reason}", path.display())]
    DataQuality { path: PathBuf, reason: String },
}

impl L2dError {
    pub fn contract(msg: impl Into<String>) -> Self {
        L2dError::ContractViolation(msg.into())
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, L2dError::ContractViolation(_))
    }
}

/// True if `err` wraps a [`L2dError::ContractViolation`]
pub fn is_contract_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<L2dError>()
        .map(L2dError::is_contract_violation)
        .unwrap_or(false)
}
