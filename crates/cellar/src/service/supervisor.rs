//! Service supervisor - owns service rows and their backing processes.
//!
//! Starts/stops/restarts each service's process, allocates and releases
//! ports, and records per-service failures without letting one service take
//! its siblings down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::activity::ActivityRepository;
use crate::cell::{Cell, CellRepository};
use crate::config::TemplateConfig;
use crate::exec::run_command;

use super::error::{ServiceSupervisorError, TemplateSetupError};
use super::models::{CellService, ServiceDefinition, ServiceStatus, ServiceType};
use super::ports::PortAllocator;
use super::repository::ServiceRepository;

/// Grace period a portless service gets to prove it did not die on startup.
const SPAWN_GRACE: Duration = Duration::from_millis(300);

/// Poll interval for readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Handle to a supervised service process.
#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    child: Child,
}

impl ProcessHandle {
    fn new(child: Child) -> Option<Self> {
        let pid = child.id()?;
        Some(Self { pid, child })
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the process and wait for it to be reaped, preventing zombies.
    async fn kill(&mut self) -> Result<()> {
        if let Err(e) = self.child.kill().await {
            if self.is_running() {
                return Err(anyhow::anyhow!("failed to kill process: {}", e));
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                warn!("Error waiting for process {}: {:?}", self.pid, e);
                Ok(())
            }
            Err(_) => {
                warn!("Timeout waiting for process {} to exit", self.pid);
                Ok(())
            }
        }
    }
}

/// Supervisor for cell services.
pub struct ServiceSupervisor {
    repo: ServiceRepository,
    cells: CellRepository,
    activity: ActivityRepository,
    ports: PortAllocator,
    /// service_id -> live process handle. At most one per service.
    processes: Arc<Mutex<HashMap<String, ProcessHandle>>>,
}

impl Clone for ServiceSupervisor {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            cells: self.cells.clone(),
            activity: self.activity.clone(),
            ports: self.ports.clone(),
            processes: Arc::clone(&self.processes),
        }
    }
}

impl ServiceSupervisor {
    /// Create a new supervisor.
    pub fn new(
        repo: ServiceRepository,
        cells: CellRepository,
        activity: ActivityRepository,
        ports: PortAllocator,
    ) -> Self {
        Self {
            repo,
            cells,
            activity,
            ports,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run a template's setup commands in the cell's worktree.
    ///
    /// The first failing command is returned as a [`TemplateSetupError`]
    /// preserving the template ID and the underlying exit code.
    pub async fn run_template_setup(
        &self,
        cell: &Cell,
        template: &TemplateConfig,
    ) -> Result<(), TemplateSetupError> {
        let Some(ref worktree) = cell.workspace_path else {
            return Ok(());
        };
        let worktree = PathBuf::from(worktree);
        let env = HashMap::new();

        for command in &template.setup {
            info!("Running setup command `{}` for cell {}", command, cell.id);
            if let Err(source) = run_command(command, &worktree, &env).await {
                return Err(TemplateSetupError {
                    command: command.clone(),
                    template_id: template.id.clone(),
                    workspace_path: worktree.clone(),
                    source,
                });
            }
        }

        Ok(())
    }

    /// Ensure every template-declared service exists and is running.
    ///
    /// Runs the template setup commands first, then find-or-creates each
    /// service row (idempotent across retries and resume) and starts it
    /// unless already running. One service's failure is recorded on its row
    /// and does not abort its siblings; the aggregate is surfaced as a
    /// [`ServiceSupervisorError`] so the orchestrator decides cell status.
    pub async fn ensure_services_for_cell(
        &self,
        cell: &Cell,
        template: &TemplateConfig,
    ) -> Result<(), ServiceSupervisorError> {
        self.run_template_setup(cell, template).await?;

        let total = template.services.len();
        let mut failed = 0_usize;

        for definition in &template.services {
            let service = self
                .find_or_create(cell, definition)
                .await
                .map_err(ServiceSupervisorError::Other)?;

            if self.is_service_live(&service).await {
                debug!("Service {} ({}) already running", service.name, service.id);
                continue;
            }

            if let Err(e) = self.start_inner(&service).await {
                warn!(
                    "Failed to start service {} for cell {}: {:#}",
                    service.name, cell.id, e
                );
                self.mark_error(&service.id, &e.to_string())
                    .await
                    .map_err(ServiceSupervisorError::Other)?;
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(ServiceSupervisorError::Partial { failed, total });
        }

        Ok(())
    }

    /// Find-or-create the service row for a template definition, keyed by
    /// (cell, name).
    async fn find_or_create(
        &self,
        cell: &Cell,
        definition: &ServiceDefinition,
    ) -> Result<CellService> {
        if let Some(existing) = self.repo.find_by_name(&cell.id, &definition.name).await? {
            return Ok(existing);
        }

        let worktree = cell
            .workspace_path
            .clone()
            .unwrap_or_else(|| cell.workspace_root_path.clone());
        let cwd = match &definition.cwd {
            Some(rel) => Path::new(&worktree).join(rel).display().to_string(),
            None => worktree,
        };

        let now = Utc::now().to_rfc3339();
        let service = CellService {
            id: Uuid::new_v4().to_string(),
            cell_id: cell.id.clone(),
            name: definition.name.clone(),
            service_type: definition.service_type,
            command: definition.command.clone(),
            cwd,
            env: serde_json::to_string(&definition.env).unwrap_or_else(|_| "{}".to_string()),
            status: ServiceStatus::Stopped,
            port: None,
            pid: None,
            ready_timeout_ms: definition.ready_timeout_ms as i64,
            last_known_error: None,
            definition: serde_json::to_string(definition).unwrap_or_else(|_| "{}".to_string()),
            created_at: now.clone(),
            updated_at: now,
        };
        self.repo.create(&service).await?;

        Ok(service)
    }

    /// Whether the service row has a live backing process in this supervisor.
    async fn is_service_live(&self, service: &CellService) -> bool {
        if !service.is_live() {
            return false;
        }
        let mut processes = self.processes.lock().await;
        processes
            .get_mut(&service.id)
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// Start a single service, enforcing the archived-cell precondition
    /// before any process action. Appends a `service.start` activity event.
    pub async fn start_service_by_id(&self, service_id: &str) -> Result<CellService> {
        let (service, cell) = self.service_and_cell(service_id).await?;

        if !cell.is_operable() {
            anyhow::bail!(
                "cannot start service `{}`: cell {} is archived",
                service.name,
                cell.id
            );
        }

        if self.is_service_live(&service).await {
            debug!("Service {} already running", service.name);
            return self.reload(service_id).await;
        }

        let result = self.start_inner(&service).await;
        if let Err(ref e) = result {
            self.mark_error(service_id, &e.to_string()).await?;
        }

        self.activity
            .append(
                &cell.id,
                "service.start",
                serde_json::json!({ "service_id": service_id, "name": service.name }),
            )
            .await?;

        result?;
        self.reload(service_id).await
    }

    /// Stop a single service. `release_port` returns the port to the shared
    /// pool; a transient restart keeps the assignment.
    pub async fn stop_service_by_id(
        &self,
        service_id: &str,
        release_port: bool,
    ) -> Result<CellService> {
        let (service, cell) = self.service_and_cell(service_id).await?;

        if !cell.is_operable() {
            anyhow::bail!(
                "cannot stop service `{}`: cell {} is archived",
                service.name,
                cell.id
            );
        }

        self.stop_inner(&service, release_port).await?;

        self.activity
            .append(
                &cell.id,
                "service.stop",
                serde_json::json!({ "service_id": service_id, "name": service.name }),
            )
            .await?;

        self.reload(service_id).await
    }

    /// Restart a single service, preserving its stored definition and port.
    pub async fn restart_service_by_id(&self, service_id: &str) -> Result<CellService> {
        let (service, cell) = self.service_and_cell(service_id).await?;

        if !cell.is_operable() {
            anyhow::bail!(
                "cannot restart service `{}`: cell {} is archived",
                service.name,
                cell.id
            );
        }

        self.stop_inner(&service, false).await?;
        let service = self
            .repo
            .get(service_id)
            .await?
            .context("service disappeared during restart")?;

        let result = self.start_inner(&service).await;
        if let Err(ref e) = result {
            self.mark_error(service_id, &e.to_string()).await?;
        }

        self.activity
            .append(
                &cell.id,
                "service.restart",
                serde_json::json!({ "service_id": service_id, "name": service.name }),
            )
            .await?;

        result?;
        self.reload(service_id).await
    }

    /// Start all of a cell's services. Emits one `services.start` bulk event
    /// plus one `service.start` per affected service.
    pub async fn start_services_for_cell(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let cell = self.cell(cell_id).await?;
        if !cell.is_operable() {
            anyhow::bail!("cannot start services: cell {} is archived", cell.id);
        }

        let services = self.repo.list_for_cell(cell_id).await?;
        self.activity
            .append(
                cell_id,
                "services.start",
                serde_json::json!({ "count": services.len() }),
            )
            .await?;

        for service in &services {
            if self.is_service_live(service).await {
                continue;
            }
            if let Err(e) = self.start_inner(service).await {
                warn!("Failed to start service {}: {:#}", service.name, e);
                self.mark_error(&service.id, &e.to_string()).await?;
            }
            self.activity
                .append(
                    cell_id,
                    "service.start",
                    serde_json::json!({ "service_id": service.id, "name": service.name }),
                )
                .await?;
        }

        self.repo.list_for_cell(cell_id).await
    }

    /// Stop all of a cell's services. Emits one `services.stop` bulk event
    /// plus one `service.stop` per affected service.
    pub async fn stop_services_for_cell(
        &self,
        cell_id: &str,
        release_ports: bool,
    ) -> Result<Vec<CellService>> {
        let services = self.repo.list_for_cell(cell_id).await?;

        self.activity
            .append(
                cell_id,
                "services.stop",
                serde_json::json!({ "count": services.len(), "release_ports": release_ports }),
            )
            .await?;

        for service in &services {
            self.stop_inner(service, release_ports).await?;
            self.activity
                .append(
                    cell_id,
                    "service.stop",
                    serde_json::json!({ "service_id": service.id, "name": service.name }),
                )
                .await?;
        }

        self.repo.list_for_cell(cell_id).await
    }

    /// Restart all of a cell's services (stop-then-start, ports kept).
    pub async fn restart_services_for_cell(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let cell = self.cell(cell_id).await?;
        if !cell.is_operable() {
            anyhow::bail!("cannot restart services: cell {} is archived", cell.id);
        }

        let services = self.repo.list_for_cell(cell_id).await?;
        for service in &services {
            self.stop_inner(service, false).await?;
        }
        for service in &services {
            let service = self
                .repo
                .get(&service.id)
                .await?
                .context("service disappeared during restart")?;
            if let Err(e) = self.start_inner(&service).await {
                warn!("Failed to restart service {}: {:#}", service.name, e);
                self.mark_error(&service.id, &e.to_string()).await?;
            }
        }

        self.repo.list_for_cell(cell_id).await
    }

    /// List a cell's services, reconciling rows whose process died.
    pub async fn list_services(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let services = self.repo.list_for_cell(cell_id).await?;

        let mut dead = Vec::new();
        {
            let mut processes = self.processes.lock().await;
            for service in &services {
                if !service.is_live() {
                    continue;
                }
                let alive = processes
                    .get_mut(&service.id)
                    .map(|h| h.is_running())
                    .unwrap_or(false);
                if !alive {
                    processes.remove(&service.id);
                    dead.push(service.id.clone());
                }
            }
        }

        if dead.is_empty() {
            return Ok(services);
        }

        for id in dead {
            warn!("Service {} process is gone, marking errored", id);
            self.repo.mark_error(&id, "process exited unexpectedly").await?;
        }
        self.repo.list_for_cell(cell_id).await
    }

    /// Record a failure on a service row (status → error, pid cleared).
    pub async fn mark_error(&self, service_id: &str, message: &str) -> Result<()> {
        self.repo.mark_error(service_id, message).await
    }

    /// Get a single service row.
    pub async fn get_service(&self, service_id: &str) -> Result<Option<CellService>> {
        self.repo.get(service_id).await
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    async fn cell(&self, cell_id: &str) -> Result<Cell> {
        self.cells
            .get(cell_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("cell not found: {}", cell_id))
    }

    async fn service_and_cell(&self, service_id: &str) -> Result<(CellService, Cell)> {
        let service = self
            .repo
            .get(service_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("service not found: {}", service_id))?;
        let cell = self.cell(&service.cell_id).await?;
        Ok((service, cell))
    }

    async fn reload(&self, service_id: &str) -> Result<CellService> {
        self.repo
            .get(service_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("service not found: {}", service_id))
    }

    /// Spawn the service's process and drive it to running (or error), with
    /// no activity logging. The caller owns event emission.
    async fn start_inner(&self, service: &CellService) -> Result<()> {
        let definition = service.definition().unwrap_or_else(|| ServiceDefinition {
            name: service.name.clone(),
            command: service.command.clone(),
            service_type: service.service_type,
            cwd: None,
            env: service.env_map(),
            ready_timeout_ms: service.ready_timeout_ms as u64,
            expose_port: false,
        });

        // Keep an existing assignment across restarts; allocate otherwise.
        let port = if definition.expose_port {
            match service.port {
                Some(p) => Some(p as u16),
                None => Some(self.ports.allocate().await?),
            }
        } else {
            None
        };

        let mut env = service.env_map();
        if let Some(p) = port {
            env.insert("PORT".to_string(), p.to_string());
        }

        let command_line = build_launch_command(&definition, port);
        info!(
            "Starting service {} ({}) for cell {}: `{}`",
            service.name, service.service_type, service.cell_id, command_line
        );

        // Clear any stale handle left from a previous run.
        self.kill_process(&service.id).await;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command_line)
            .current_dir(&service.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning service `{}`", service.name))?;
        let handle =
            ProcessHandle::new(child).context("failed to get PID for service process")?;
        let pid = handle.pid;

        {
            let mut processes = self.processes.lock().await;
            processes.insert(service.id.clone(), handle);
        }

        self.repo
            .mark_starting(&service.id, pid as i64, port.map(i64::from))
            .await?;

        self.wait_until_ready(service, port).await?;
        self.repo.mark_running(&service.id).await?;
        info!(
            "Service {} running (pid {}, port {:?})",
            service.name, pid, port
        );

        Ok(())
    }

    /// Wait for the service to be judged ready.
    ///
    /// Port-bearing services are probed over HTTP until `ready_timeout_ms`
    /// elapses; portless services only need their process to survive a short
    /// grace period.
    async fn wait_until_ready(&self, service: &CellService, port: Option<u16>) -> Result<()> {
        let timeout = Duration::from_millis(service.ready_timeout_ms.max(0) as u64);

        let Some(port) = port else {
            tokio::time::sleep(SPAWN_GRACE).await;
            let mut processes = self.processes.lock().await;
            let alive = processes
                .get_mut(&service.id)
                .map(|h| h.is_running())
                .unwrap_or(false);
            if !alive {
                processes.remove(&service.id);
                anyhow::bail!("service `{}` exited during startup", service.name);
            }
            return Ok(());
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("building readiness HTTP client")?;
        let url = format!("http://127.0.0.1:{}/", port);

        let start = tokio::time::Instant::now();
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;

            // Any HTTP response counts as ready; only connect failures don't.
            if client.get(&url).send().await.is_ok() {
                return Ok(());
            }

            {
                let mut processes = self.processes.lock().await;
                let alive = processes
                    .get_mut(&service.id)
                    .map(|h| h.is_running())
                    .unwrap_or(false);
                if !alive {
                    processes.remove(&service.id);
                    anyhow::bail!("service `{}` exited before becoming ready", service.name);
                }
            }

            if start.elapsed() >= timeout {
                self.kill_process(&service.id).await;
                anyhow::bail!(
                    "service `{}` not ready after {} attempts over {:?}",
                    service.name,
                    attempts,
                    timeout
                );
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn stop_inner(&self, service: &CellService, release_port: bool) -> Result<()> {
        self.kill_process(&service.id).await;
        self.repo.mark_stopped(&service.id, release_port).await?;
        info!(
            "Stopped service {} (release_port={})",
            service.name, release_port
        );
        Ok(())
    }

    async fn kill_process(&self, service_id: &str) {
        let handle = {
            let mut processes = self.processes.lock().await;
            processes.remove(service_id)
        };
        if let Some(mut handle) = handle {
            debug!("Killing service process (pid {})", handle.pid);
            if let Err(e) = handle.kill().await {
                warn!("Failed to kill service process {}: {:?}", handle.pid, e);
            }
        }
    }
}

/// Assemble the launch command line for a definition. The state machine is
/// identical across types; only the recipe differs.
fn build_launch_command(definition: &ServiceDefinition, port: Option<u16>) -> String {
    match definition.service_type {
        ServiceType::Process => definition.command.clone(),
        ServiceType::Docker => {
            let publish = port
                .map(|p| format!(" -p {}:{}", p, p))
                .unwrap_or_default();
            format!("docker run --rm{} {}", publish, definition.command)
        }
        ServiceType::Compose => format!("docker compose {}", definition.command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_for_process_is_verbatim() {
        let def = ServiceDefinition {
            name: "dev".to_string(),
            command: "npm run dev".to_string(),
            service_type: ServiceType::Process,
            cwd: None,
            env: HashMap::new(),
            ready_timeout_ms: 1000,
            expose_port: false,
        };
        assert_eq!(build_launch_command(&def, None), "npm run dev");
    }

    #[test]
    fn launch_command_for_docker_publishes_port() {
        let def = ServiceDefinition {
            name: "db".to_string(),
            command: "postgres:16".to_string(),
            service_type: ServiceType::Docker,
            cwd: None,
            env: HashMap::new(),
            ready_timeout_ms: 1000,
            expose_port: true,
        };
        assert_eq!(
            build_launch_command(&def, Some(5599)),
            "docker run --rm -p 5599:5599 postgres:16"
        );
    }

    #[test]
    fn launch_command_for_compose_prefixes_invocation() {
        let def = ServiceDefinition {
            name: "stack".to_string(),
            command: "-f compose.yaml up".to_string(),
            service_type: ServiceType::Compose,
            cwd: None,
            env: HashMap::new(),
            ready_timeout_ms: 1000,
            expose_port: false,
        };
        assert_eq!(
            build_launch_command(&def, None),
            "docker compose -f compose.yaml up"
        );
    }
}
