//! Typed errors for the service supervisor.

use std::path::PathBuf;

use thiserror::Error;

use crate::exec::CommandExecutionError;

/// A template setup command failed while provisioning a cell.
///
/// The formatted message keeps both the template ID and the underlying exit
/// code; it is stored verbatim in the cell's `last_setup_error`.
#[derive(Debug, Error)]
#[error("Setup command `{command}` failed (Template ID: {template_id}, workspace {}): {source}", .workspace_path.display())]
pub struct TemplateSetupError {
    /// The setup command that failed.
    pub command: String,
    /// Template the command came from.
    pub template_id: String,
    /// Worktree the command ran in.
    pub workspace_path: PathBuf,
    /// The underlying command failure.
    #[source]
    pub source: CommandExecutionError,
}

/// Tagged wrapper used to propagate any service-level failure without
/// aborting unrelated services.
#[derive(Debug, Error)]
pub enum ServiceSupervisorError {
    #[error(transparent)]
    Setup(#[from] TemplateSetupError),

    #[error("{failed} of {total} services failed to start")]
    Partial { failed: usize, total: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
