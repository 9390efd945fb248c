//! Cell data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Cell lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    /// Provisioning in flight (initial state).
    Spawning,
    /// Environment fully provisioned.
    Ready,
    /// Provisioning or setup failed; retryable.
    Error,
    /// Services stopped and agent session closed; worktree retained.
    Archived,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Spawning => write!(f, "spawning"),
            CellStatus::Ready => write!(f, "ready"),
            CellStatus::Error => write!(f, "error"),
            CellStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for CellStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spawning" => Ok(CellStatus::Spawning),
            "ready" => Ok(CellStatus::Ready),
            "error" => Ok(CellStatus::Error),
            "archived" => Ok(CellStatus::Archived),
            _ => Err(format!("unknown cell status: {}", s)),
        }
    }
}

impl TryFrom<String> for CellStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// Workflow phase of the cell's agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellPhase {
    Planning,
    PlanReview,
    Implementation,
}

impl std::fmt::Display for CellPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellPhase::Planning => write!(f, "planning"),
            CellPhase::PlanReview => write!(f, "plan_review"),
            CellPhase::Implementation => write!(f, "implementation"),
        }
    }
}

impl std::str::FromStr for CellPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(CellPhase::Planning),
            "plan_review" => Ok(CellPhase::PlanReview),
            "implementation" => Ok(CellPhase::Implementation),
            _ => Err(format!("unknown cell phase: {}", s)),
        }
    }
}

impl TryFrom<String> for CellPhase {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// An isolated sandbox: worktree + agent session + services + terminals.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cell {
    /// Unique cell ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form description; when non-blank it is sent as the first agent
    /// prompt.
    pub description: String,
    /// Template the cell was created from.
    pub template_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Worktree path, once created.
    pub workspace_path: Option<String>,
    /// Workspace root checkout path.
    pub workspace_root_path: String,
    /// Branch checked out in the worktree.
    pub branch_name: Option<String>,
    /// Commit the worktree was branched from.
    pub base_commit: Option<String>,
    /// Lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: CellStatus,
    /// Agent workflow phase.
    #[sqlx(try_from = "String")]
    pub phase: CellPhase,
    /// Last setup failure, verbatim.
    pub last_setup_error: Option<String>,
    /// When the cell was created.
    pub created_at: String,
}

impl Cell {
    /// Whether the cell still admits service and terminal operations.
    pub fn is_operable(&self) -> bool {
        !matches!(self.status, CellStatus::Archived)
    }
}

/// Durable bookkeeping for crash-safe provisioning resume. Exactly one row
/// per cell.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CellProvisioningState {
    /// Owning cell.
    pub cell_id: String,
    /// Explicit model override from the create request.
    pub model_id_override: Option<String>,
    /// Explicit provider override from the create request.
    pub provider_id_override: Option<String>,
    /// Number of provisioning attempts, including resumed ones.
    pub attempt_count: i64,
    /// When the current attempt started.
    pub started_at: String,
    /// When the last attempt finished (success or recorded failure).
    pub finished_at: Option<String>,
}

/// Request to create a new cell.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCellRequest {
    /// Template to provision from.
    pub template_id: String,
    /// Workspace to carve the worktree out of.
    pub workspace_id: String,
    /// Optional name; a readable one is generated when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional description, sent as the first agent prompt when non-blank.
    #[serde(default)]
    pub description: Option<String>,
    /// Explicit model override.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Explicit provider override.
    #[serde(default)]
    pub provider_id: Option<String>,
}
