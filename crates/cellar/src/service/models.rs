//! Service data models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Supervised service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Not running (initial state, or after an explicit stop).
    Stopped,
    /// Process launched, readiness not yet confirmed.
    Starting,
    /// Process alive and, for port-bearing services, judged ready.
    Running,
    /// Launch failed, crashed, or timed out waiting for readiness.
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "stopped"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Running => write!(f, "running"),
            ServiceStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stopped" => Ok(ServiceStatus::Stopped),
            "starting" => Ok(ServiceStatus::Starting),
            "running" => Ok(ServiceStatus::Running),
            "error" => Ok(ServiceStatus::Error),
            _ => Err(format!("unknown service status: {}", s)),
        }
    }
}

impl TryFrom<String> for ServiceStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// How a service's "start" is implemented. The state machine and public
/// contract are identical across types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Direct process spawn.
    #[default]
    Process,
    /// `docker run` invocation.
    Docker,
    /// `docker compose` invocation.
    Compose,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Process => write!(f, "process"),
            ServiceType::Docker => write!(f, "docker"),
            ServiceType::Compose => write!(f, "compose"),
        }
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(ServiceType::Process),
            "docker" => Ok(ServiceType::Docker),
            "compose" => Ok(ServiceType::Compose),
            _ => Err(format!("unknown service type: {}", s)),
        }
    }
}

impl TryFrom<String> for ServiceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

/// A service as declared by a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Service name, unique within a template (and so within a cell).
    pub name: String,
    /// Command line launched through `sh -c` (or the container image for
    /// `docker`, the compose file for `compose`).
    pub command: String,
    /// Launch recipe.
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    /// Working directory, relative to the worktree root.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Milliseconds to wait for readiness before marking the service errored.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Allocate a port from the shared pool and inject it as `$PORT`.
    #[serde(default)]
    pub expose_port: bool,
}

/// A supervised service row, one per template-declared service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CellService {
    /// Unique service ID.
    pub id: String,
    /// Owning cell.
    pub cell_id: String,
    /// Service name, unique within the cell.
    pub name: String,
    /// Launch recipe.
    #[sqlx(try_from = "String")]
    pub service_type: ServiceType,
    /// Command line.
    pub command: String,
    /// Working directory the process runs in.
    pub cwd: String,
    /// Environment variables, JSON-encoded.
    pub env: String,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: ServiceStatus,
    /// Allocated port, unique while the service is starting/running.
    pub port: Option<i64>,
    /// OS process ID while running.
    pub pid: Option<i64>,
    /// Readiness timeout in milliseconds.
    pub ready_timeout_ms: i64,
    /// Last recorded failure, if any.
    pub last_known_error: Option<String>,
    /// Original template service spec, JSON-encoded.
    pub definition: String,
    /// When the row was created.
    pub created_at: String,
    /// When the row was last updated.
    pub updated_at: String,
}

impl CellService {
    /// Decode the JSON environment column.
    pub fn env_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env).unwrap_or_default()
    }

    /// Decode the stored template definition.
    pub fn definition(&self) -> Option<ServiceDefinition> {
        serde_json::from_str(&self.definition).ok()
    }

    /// Whether the service currently holds a process.
    pub fn is_live(&self) -> bool {
        matches!(self.status, ServiceStatus::Starting | ServiceStatus::Running)
    }
}
