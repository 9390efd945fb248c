//! Cell lifecycle: models, persistence, provisioning orchestration.

mod models;
mod orchestrator;
mod repository;

pub use models::{Cell, CellPhase, CellProvisioningState, CellStatus, CreateCellRequest};
pub use orchestrator::{CellOrchestrator, CellUpdate};
pub use repository::CellRepository;
