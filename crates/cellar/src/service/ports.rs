//! Shared service port pool.
//!
//! Allocation is unique-while-held: a port stays assigned to its service row
//! until an explicit release, so transient restarts keep their assignment.

use anyhow::Result;

use super::repository::ServiceRepository;

/// Upper bound of the scan range.
const MAX_PORT: u16 = 65_000;

/// Allocator over the shared port pool, backed by the service table.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    repo: ServiceRepository,
    base_port: u16,
}

impl PortAllocator {
    /// Create an allocator starting its scan at `base_port`.
    pub fn new(repo: ServiceRepository, base_port: u16) -> Self {
        Self { repo, base_port }
    }

    /// Allocate the lowest free port at or above the base port.
    ///
    /// A port is free when no service row holds it and the OS accepts a bind.
    pub async fn allocate(&self) -> Result<u16> {
        let held = self.repo.held_ports().await?;

        let mut port = self.base_port;
        loop {
            if !held.contains(&(port as i64)) && is_port_available(port) {
                return Ok(port);
            }

            if port >= MAX_PORT {
                anyhow::bail!("no free port available in pool");
            }
            port += 1;
        }
    }
}

/// Check if a port is available for binding.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}
