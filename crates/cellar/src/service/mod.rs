//! Service supervision: rows, ports, processes.

mod error;
mod models;
mod ports;
mod repository;
mod supervisor;

pub use error::{ServiceSupervisorError, TemplateSetupError};
pub use models::{CellService, ServiceDefinition, ServiceStatus, ServiceType};
pub use ports::{PortAllocator, is_port_available};
pub use repository::ServiceRepository;
pub use supervisor::ServiceSupervisor;
