//! Cell orchestrator - drives provisioning and lifecycle transitions.
//!
//! Creation persists intent (the provisioning-state row) before side effects
//! and returns immediately; the remaining steps run as a detached workflow
//! whose outcome is recorded on the cell row, never thrown back to the
//! caller. `resume_spawning_cells` replays that durable intent after a
//! crash instead of trusting in-memory task state.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::activity::ActivityRepository;
use crate::agent::{AgentRuntime, AgentSessionSpec};
use crate::config::{
    ProviderEntry, TemplateConfig, WorkspaceConfig, WorkspaceContextResolutionError,
    WorkspaceRegistry,
};
use crate::service::{ServiceSupervisor, ServiceSupervisorError};
use crate::terminal::TerminalMultiplexer;
use crate::wordlist;
use crate::worktree::WorktreeManager;

use super::models::{Cell, CellPhase, CellProvisioningState, CellStatus, CreateCellRequest};
use super::repository::CellRepository;

/// Capacity of the cell-update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A cell-level status change, published to workspace stream subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CellUpdate {
    pub cell_id: String,
    pub workspace_id: String,
    pub status: String,
}

/// Orchestrates cell provisioning and lifecycle.
pub struct CellOrchestrator {
    repo: CellRepository,
    registry: WorkspaceRegistry,
    providers: Vec<ProviderEntry>,
    supervisor: ServiceSupervisor,
    worktrees: Arc<dyn WorktreeManager>,
    agents: Arc<dyn AgentRuntime>,
    activity: ActivityRepository,
    terminals: TerminalMultiplexer,
    /// Cells with a provisioning workflow currently in flight in this
    /// process; provisioning one cell is never invoked twice concurrently.
    in_flight: Arc<DashMap<String, ()>>,
    updates: broadcast::Sender<CellUpdate>,
}

impl Clone for CellOrchestrator {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            registry: self.registry.clone(),
            providers: self.providers.clone(),
            supervisor: self.supervisor.clone(),
            worktrees: Arc::clone(&self.worktrees),
            agents: Arc::clone(&self.agents),
            activity: self.activity.clone(),
            terminals: self.terminals.clone(),
            in_flight: Arc::clone(&self.in_flight),
            updates: self.updates.clone(),
        }
    }
}

impl CellOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        repo: CellRepository,
        registry: WorkspaceRegistry,
        providers: Vec<ProviderEntry>,
        supervisor: ServiceSupervisor,
        worktrees: Arc<dyn WorktreeManager>,
        agents: Arc<dyn AgentRuntime>,
        activity: ActivityRepository,
        terminals: TerminalMultiplexer,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            repo,
            registry,
            providers,
            supervisor,
            worktrees,
            agents,
            activity,
            terminals,
            in_flight: Arc::new(DashMap::new()),
            updates,
        }
    }

    /// Subscribe to cell-level status updates.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<CellUpdate> {
        self.updates.subscribe()
    }

    /// Validate the request, persist the cell with `status=spawning` plus its
    /// provisioning-state row, and kick off the background workflow. Returns
    /// immediately; the caller never blocks on provisioning.
    pub async fn create_cell(&self, request: CreateCellRequest) -> Result<Cell> {
        let workspace = self.registry.get(&request.workspace_id)?.clone();
        // Validate the template up front so bad requests fail synchronously.
        let _ = self
            .registry
            .resolve_template(&request.workspace_id, &request.template_id)?;

        let cell_id = Uuid::new_v4().to_string();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| wordlist::readable_name_from_cell_id(&cell_id));

        let cell = Cell {
            id: cell_id.clone(),
            name,
            description: request.description.unwrap_or_default(),
            template_id: request.template_id.clone(),
            workspace_id: request.workspace_id.clone(),
            workspace_path: None,
            workspace_root_path: workspace.root.display().to_string(),
            branch_name: None,
            base_commit: None,
            status: CellStatus::Spawning,
            phase: CellPhase::Planning,
            last_setup_error: None,
            created_at: Utc::now().to_rfc3339(),
        };

        let state = CellProvisioningState {
            cell_id: cell_id.clone(),
            model_id_override: request.model_id,
            provider_id_override: request.provider_id,
            attempt_count: 1,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
        };

        self.repo.create(&cell, &state).await?;
        self.activity
            .append(
                &cell_id,
                "cell.create",
                serde_json::json!({ "template_id": cell.template_id, "name": cell.name }),
            )
            .await?;
        self.publish(&cell, "spawning");

        info!(
            "Created cell {} ({}) from template {}",
            cell.id, cell.name, cell.template_id
        );

        let orchestrator = self.clone();
        let spawn_id = cell_id.clone();
        tokio::spawn(async move {
            orchestrator.provision_detached(spawn_id).await;
        });

        Ok(cell)
    }

    /// Re-drive provisioning for every cell stranded in `spawning`. Run once
    /// at process startup.
    pub async fn resume_spawning_cells(&self) -> Result<usize> {
        let stranded = self.repo.list_spawning().await?;
        let count = stranded.len();

        for cell in stranded {
            warn!("Resuming stranded spawning cell {} ({})", cell.id, cell.name);
            self.repo.begin_provisioning_attempt(&cell.id).await?;

            let orchestrator = self.clone();
            let cell_id = cell.id.clone();
            tokio::spawn(async move {
                orchestrator.provision_detached(cell_id).await;
            });
        }

        Ok(count)
    }

    /// Background wrapper: failures are captured on the cell row.
    async fn provision_detached(&self, cell_id: String) {
        // Per-cell single flight; parallel across cells.
        if self.in_flight.insert(cell_id.clone(), ()).is_some() {
            warn!("Provisioning already in flight for cell {}", cell_id);
            return;
        }

        let outcome = self.provision(&cell_id).await;
        self.in_flight.remove(&cell_id);

        if let Err(e) = outcome {
            error!("Provisioning cell {} failed: {:#}", cell_id, e);
            if let Err(persist_err) = self.fail_cell(&cell_id, &format!("{:#}", e)).await {
                error!(
                    "Failed to record provisioning failure for cell {}: {:#}",
                    cell_id, persist_err
                );
            }
        }
    }

    /// The provisioning workflow, steps strictly sequential within one cell.
    async fn provision(&self, cell_id: &str) -> Result<()> {
        let mut cell = self
            .repo
            .get(cell_id)
            .await?
            .context("cell disappeared during provisioning")?;

        // 1. Worktree (reused when resuming an attempt that got this far).
        if cell.workspace_path.is_none() {
            let worktree = self.worktrees.create_worktree(&cell).await?;
            self.repo
                .set_worktree(
                    cell_id,
                    &worktree.path.display().to_string(),
                    &worktree.branch,
                    &worktree.base_commit,
                )
                .await?;
            cell = self
                .repo
                .get(cell_id)
                .await?
                .context("cell disappeared after worktree creation")?;
        }

        // 2. Template config for the target workspace.
        let (workspace_config, template) =
            match self.registry.resolve_template(&cell.workspace_id, &cell.template_id) {
                Ok(resolved) => resolved,
                Err(WorkspaceContextResolutionError::TemplateNotFound { template_id, .. }) => {
                    self.fail_cell(
                        cell_id,
                        &format!("Template {} no longer exists", template_id),
                    )
                    .await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

        // 3. Services; a setup failure is recorded verbatim, siblings run on.
        match self.supervisor.ensure_services_for_cell(&cell, &template).await {
            Ok(()) => {}
            Err(ServiceSupervisorError::Setup(setup_err)) => {
                self.fail_cell(cell_id, &setup_err.to_string()).await?;
                return Ok(());
            }
            Err(e) => {
                self.fail_cell(cell_id, &e.to_string()).await?;
                return Ok(());
            }
        }

        // 4. Agent session, honoring overrides with catalog fallback.
        let session = self
            .ensure_agent_session_for(&cell, &workspace_config, &template)
            .await?;

        // 5. Initial prompt: one retry after re-acquiring the session.
        if !cell.description.trim().is_empty() {
            if let Err(first) = self
                .agents
                .send_agent_message(&session.id, &cell.description)
                .await
            {
                warn!(
                    "Initial prompt for cell {} failed, retrying once: {:#}",
                    cell.id, first
                );
                let session = self
                    .ensure_agent_session_for(&cell, &workspace_config, &template)
                    .await?;
                self.agents
                    .send_agent_message(&session.id, &cell.description)
                    .await
                    .context("sending initial agent prompt (retry)")?;
            }
        }

        // 6. Ready.
        self.repo.mark_ready(cell_id).await?;
        self.repo.finish_provisioning_attempt(cell_id).await?;
        self.publish(&cell, "ready");
        info!("Cell {} is ready", cell.id);

        Ok(())
    }

    async fn ensure_agent_session_for(
        &self,
        cell: &Cell,
        workspace_config: &WorkspaceConfig,
        template: &TemplateConfig,
    ) -> Result<crate::agent::AgentSessionRecord> {
        let state = self
            .repo
            .provisioning_state(&cell.id)
            .await?
            .context("provisioning state missing")?;

        let (provider, model_id) =
            resolve_agent_selection(&state, template, workspace_config, &self.providers)?;

        let spec = AgentSessionSpec {
            template_id: cell.template_id.clone(),
            provider,
            model_id,
            worktree_path: cell
                .workspace_path
                .clone()
                .unwrap_or_else(|| cell.workspace_root_path.clone())
                .into(),
        };

        self.agents.ensure_agent_session(&cell.id, &spec).await
    }

    /// Record a provisioning/setup failure on the cell row.
    async fn fail_cell(&self, cell_id: &str, message: &str) -> Result<()> {
        self.repo.mark_error(cell_id, message).await?;
        self.repo.finish_provisioning_attempt(cell_id).await?;
        if let Some(cell) = self.repo.get(cell_id).await? {
            self.publish(&cell, "error");
        }
        Ok(())
    }

    /// Re-run template setup commands for an errored cell. Appends exactly
    /// one `setup.retry` activity event per call, success or failure.
    pub async fn retry_setup(&self, cell_id: &str) -> Result<Cell> {
        let cell = self.get_existing(cell_id).await?;
        if cell.status != CellStatus::Error {
            anyhow::bail!(
                "cannot retry setup: cell {} is not in error state",
                cell_id
            );
        }

        self.activity
            .append(cell_id, "setup.retry", serde_json::json!({}))
            .await?;

        let template = match self
            .registry
            .resolve_template(&cell.workspace_id, &cell.template_id)
        {
            Ok((_, template)) => template,
            Err(WorkspaceContextResolutionError::TemplateNotFound { template_id, .. }) => {
                let message = format!("Template {} no longer exists", template_id);
                self.repo.mark_error(cell_id, &message).await?;
                return self.get_existing(cell_id).await;
            }
            Err(e) => return Err(e.into()),
        };

        match self.supervisor.run_template_setup(&cell, &template).await {
            Ok(()) => {
                self.repo.mark_ready(cell_id).await?;
                self.publish(&cell, "ready");
                info!("Setup retry for cell {} succeeded", cell_id);
            }
            Err(setup_err) => {
                self.repo.mark_error(cell_id, &setup_err.to_string()).await?;
                self.publish(&cell, "error");
                warn!("Setup retry for cell {} failed: {:#}", cell_id, setup_err);
            }
        }

        self.get_existing(cell_id).await
    }

    /// Archive a ready cell: stop services releasing ports, close the agent
    /// session, tear down terminals; the worktree is retained.
    pub async fn archive(&self, cell_id: &str) -> Result<Cell> {
        let cell = self.get_existing(cell_id).await?;
        if cell.status != CellStatus::Ready {
            anyhow::bail!(
                "cannot archive cell {}: status is {}",
                cell_id,
                cell.status
            );
        }

        self.supervisor
            .stop_services_for_cell(cell_id, true)
            .await?;
        self.agents.close_agent_session(cell_id).await?;
        self.terminals.close_cell(cell_id);

        self.repo.update_status(cell_id, CellStatus::Archived).await?;
        self.activity
            .append(cell_id, "cell.archive", serde_json::json!({}))
            .await?;
        self.publish(&cell, "archived");
        info!("Archived cell {}", cell_id);

        self.get_existing(cell_id).await
    }

    /// Restore an archived cell: force a new agent session and restart
    /// services.
    pub async fn restore(&self, cell_id: &str) -> Result<Cell> {
        let cell = self.get_existing(cell_id).await?;
        if cell.status != CellStatus::Archived {
            anyhow::bail!("cannot restore cell {}: not archived", cell_id);
        }

        // Flip status first so service starts pass the archived guard.
        self.repo.update_status(cell_id, CellStatus::Ready).await?;
        let cell = self.get_existing(cell_id).await?;

        let (workspace_config, template) = self
            .registry
            .resolve_template(&cell.workspace_id, &cell.template_id)?;

        // The archived session was closed; ensure creates a fresh one.
        let _ = self
            .ensure_agent_session_for(&cell, &workspace_config, &template)
            .await?;

        self.supervisor.start_services_for_cell(cell_id).await?;

        self.activity
            .append(cell_id, "cell.restore", serde_json::json!({}))
            .await?;
        self.publish(&cell, "ready");
        info!("Restored cell {}", cell_id);

        self.get_existing(cell_id).await
    }

    /// Delete an archived cell: remove the worktree exactly once, then all
    /// rows. Rejected from any other state.
    pub async fn delete(&self, cell_id: &str) -> Result<()> {
        let cell = self.get_existing(cell_id).await?;
        if cell.status != CellStatus::Archived {
            anyhow::bail!("cell {} must be archived before delete", cell_id);
        }

        self.terminals.close_cell(cell_id);
        self.worktrees
            .remove_worktree(&cell)
            .await
            .context("removing worktree")?;
        self.repo.delete(cell_id).await?;
        self.publish(&cell, "deleted");
        info!("Deleted cell {}", cell_id);

        Ok(())
    }

    async fn get_existing(&self, cell_id: &str) -> Result<Cell> {
        self.repo
            .get(cell_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("cell not found: {}", cell_id))
    }

    fn publish(&self, cell: &Cell, status: &str) {
        let _ = self.updates.send(CellUpdate {
            cell_id: cell.id.clone(),
            workspace_id: cell.workspace_id.clone(),
            status: status.to_string(),
        });
    }
}

/// Resolve provider and model: explicit overrides, then template defaults,
/// then workspace defaults, then the provider catalog.
fn resolve_agent_selection(
    state: &CellProvisioningState,
    template: &TemplateConfig,
    workspace: &WorkspaceConfig,
    providers: &[ProviderEntry],
) -> Result<(String, String)> {
    let provider = state
        .provider_id_override
        .clone()
        .or_else(|| template.agent.provider.clone())
        .or_else(|| workspace.defaults.provider.clone())
        .or_else(|| providers.first().map(|p| p.id.clone()))
        .context("no agent provider configured")?;

    let model = state
        .model_id_override
        .clone()
        .or_else(|| template.agent.model.clone())
        .or_else(|| workspace.defaults.model.clone())
        .or_else(|| {
            providers
                .iter()
                .find(|p| p.id == provider)
                .map(|p| p.default_model.clone())
        })
        .context("no agent model configured")?;

    Ok((provider, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentDefaults;

    fn state(provider: Option<&str>, model: Option<&str>) -> CellProvisioningState {
        CellProvisioningState {
            cell_id: "c1".to_string(),
            model_id_override: model.map(str::to_string),
            provider_id_override: provider.map(str::to_string),
            attempt_count: 1,
            started_at: String::new(),
            finished_at: None,
        }
    }

    fn template(provider: Option<&str>, model: Option<&str>) -> TemplateConfig {
        TemplateConfig {
            id: "t1".to_string(),
            name: None,
            setup: Vec::new(),
            services: Vec::new(),
            agent: AgentDefaults {
                provider: provider.map(str::to_string),
                model: model.map(str::to_string),
            },
        }
    }

    fn workspace(provider: Option<&str>, model: Option<&str>) -> WorkspaceConfig {
        WorkspaceConfig {
            defaults: AgentDefaults {
                provider: provider.map(str::to_string),
                model: model.map(str::to_string),
            },
            templates: Vec::new(),
        }
    }

    fn catalog() -> Vec<ProviderEntry> {
        vec![ProviderEntry {
            id: "anthropic".to_string(),
            default_model: "claude-sonnet".to_string(),
        }]
    }

    #[test]
    fn explicit_overrides_win() {
        let (provider, model) = resolve_agent_selection(
            &state(Some("openai"), Some("gpt-x")),
            &template(Some("anthropic"), Some("claude-opus")),
            &workspace(None, None),
            &catalog(),
        )
        .unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(model, "gpt-x");
    }

    #[test]
    fn template_beats_workspace_beats_catalog() {
        let (provider, model) = resolve_agent_selection(
            &state(None, None),
            &template(None, Some("claude-opus")),
            &workspace(Some("anthropic"), None),
            &catalog(),
        )
        .unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(model, "claude-opus");
    }

    #[test]
    fn catalog_is_the_last_resort() {
        let (provider, model) = resolve_agent_selection(
            &state(None, None),
            &template(None, None),
            &workspace(None, None),
            &catalog(),
        )
        .unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(model, "claude-sonnet");
    }

    #[test]
    fn empty_catalog_with_no_defaults_fails() {
        let err = resolve_agent_selection(
            &state(None, None),
            &template(None, None),
            &workspace(None, None),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("provider"));
    }
}
