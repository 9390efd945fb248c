//! Application state shared across handlers.

use std::sync::Arc;

use crate::activity::ActivityRepository;
use crate::cell::{CellOrchestrator, CellRepository};
use crate::config::WorkspaceRegistry;
use crate::service::ServiceSupervisor;
use crate::terminal::TerminalMultiplexer;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Orchestrator for cell lifecycle and provisioning.
    pub orchestrator: Arc<CellOrchestrator>,
    /// Supervisor for cell services.
    pub supervisor: Arc<ServiceSupervisor>,
    /// Terminal session multiplexer.
    pub terminals: TerminalMultiplexer,
    /// Append-only activity feed.
    pub activity: ActivityRepository,
    /// Workspace registry and manifest loader.
    pub registry: WorkspaceRegistry,
    /// Read-side cell repository.
    pub cells: CellRepository,
    /// Allowed CORS origins from the server config.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        orchestrator: CellOrchestrator,
        supervisor: ServiceSupervisor,
        terminals: TerminalMultiplexer,
        activity: ActivityRepository,
        registry: WorkspaceRegistry,
        cells: CellRepository,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            supervisor: Arc::new(supervisor),
            terminals,
            activity,
            registry,
            cells,
            allowed_origins: Vec::new(),
        }
    }

    /// Set the allowed CORS origins.
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}
