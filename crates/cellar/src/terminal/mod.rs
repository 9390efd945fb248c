//! Terminal sessions: long-lived PTY-backed processes streamed to many
//! concurrent viewers with reconnect-safe buffered replay.
//!
//! One generic multiplexer serves the four terminal kinds (cell shell, chat
//! shell, per-service terminal, setup terminal); the kinds differ only in
//! what process gets spawned. Automatic restarts are bounded by the caller's
//! retry counter, not here.

mod multiplexer;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use multiplexer::{TerminalEvent, TerminalMultiplexer, TerminalSubscription};

use crate::cell::Cell;
use crate::config::TemplateConfig;
use crate::service::CellService;

/// Terminal kind within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    /// Interactive shell in the worktree.
    Cell,
    /// Agent-chat shell.
    Chat,
    /// A service's command under a PTY.
    Service,
    /// The template's setup script.
    Setup,
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalKind::Cell => write!(f, "cell"),
            TerminalKind::Chat => write!(f, "chat"),
            TerminalKind::Service => write!(f, "service"),
            TerminalKind::Setup => write!(f, "setup"),
        }
    }
}

/// Owner key of a terminal session: one live process per key at most.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TerminalKey {
    pub cell_id: String,
    pub kind: TerminalKind,
    pub service_id: Option<String>,
}

impl TerminalKey {
    /// Key for the cell shell.
    pub fn cell(cell_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            kind: TerminalKind::Cell,
            service_id: None,
        }
    }

    /// Key for the agent-chat shell.
    pub fn chat(cell_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            kind: TerminalKind::Chat,
            service_id: None,
        }
    }

    /// Key for a per-service terminal.
    pub fn service(cell_id: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            kind: TerminalKind::Service,
            service_id: Some(service_id.into()),
        }
    }

    /// Key for the setup terminal.
    pub fn setup(cell_id: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            kind: TerminalKind::Setup,
            service_id: None,
        }
    }
}

impl std::fmt::Display for TerminalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.service_id {
            Some(service_id) => write!(f, "{}/{}/{}", self.cell_id, self.kind, service_id),
            None => write!(f, "{}/{}", self.cell_id, self.kind),
        }
    }
}

/// Terminal session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    /// Backing process alive.
    Running,
    /// Backing process exited; exit code retained for subscribers.
    Exited,
    /// Process alive but no subscriber attached.
    Disconnected,
}

/// Session metadata shown to clients (the `ready` event body).
#[derive(Debug, Clone, Serialize)]
pub struct TerminalSessionInfo {
    /// Ephemeral session ID; changes on restart.
    pub session_id: String,
    /// Backing process ID.
    pub pid: u32,
    /// Working directory of the process.
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    /// Liveness-derived status.
    pub status: TerminalStatus,
    /// Exit code, once exited.
    pub exit_code: Option<i32>,
    /// When the process was spawned.
    pub started_at: String,
    /// Monotonically increasing output chunk counter.
    pub output_seq: u64,
    /// Cumulative output length in bytes.
    pub output_len: u64,
}

/// What to spawn under the PTY for a terminal key.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    /// A `sh -c` spec for an arbitrary command line.
    pub fn shell_command(command: &str, cwd: PathBuf) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd,
            env: Vec::new(),
        }
    }

    /// An interactive login shell.
    pub fn interactive_shell(cwd: PathBuf) -> Self {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_string());
        Self {
            program: shell,
            args: vec!["-l".to_string()],
            cwd,
            env: Vec::new(),
        }
    }
}

/// Typed terminal errors.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("terminal configuration invalid: {0}")]
    Configuration(String),

    #[error("terminal process error: {0}")]
    Process(String),
}

/// Build the spawn spec for a terminal kind from its resolved context.
///
/// Cell and chat terminals get an interactive shell in the worktree; a
/// service terminal runs the service's command in its cwd with its env; the
/// setup terminal replays the template's setup commands.
pub fn spawn_spec_for(
    kind: TerminalKind,
    cell: &Cell,
    service: Option<&CellService>,
    template: Option<&TemplateConfig>,
) -> Result<SpawnSpec, TerminalError> {
    let worktree = cell
        .workspace_path
        .clone()
        .unwrap_or_else(|| cell.workspace_root_path.clone());
    let worktree = PathBuf::from(worktree);

    match kind {
        TerminalKind::Cell | TerminalKind::Chat => Ok(SpawnSpec::interactive_shell(worktree)),
        TerminalKind::Service => {
            let service = service.ok_or_else(|| {
                TerminalError::Configuration("service terminal requires a service".to_string())
            })?;
            let env: Vec<(String, String)> = service.env_map().into_iter().collect();
            let mut spec =
                SpawnSpec::shell_command(&service.command, PathBuf::from(&service.cwd));
            spec.env = env;
            if let Some(port) = service.port {
                spec.env.push(("PORT".to_string(), port.to_string()));
            }
            Ok(spec)
        }
        TerminalKind::Setup => {
            let template = template.ok_or_else(|| {
                TerminalError::Configuration("setup terminal requires a template".to_string())
            })?;
            let script = if template.setup.is_empty() {
                "echo 'no setup commands'".to_string()
            } else {
                template.setup.join(" && ")
            };
            Ok(SpawnSpec::shell_command(&script, worktree))
        }
    }
}
