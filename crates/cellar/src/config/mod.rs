//! Server configuration and workspace/template manifest resolution.
//!
//! Two layers of configuration exist: the server config (`config.toml` plus
//! `CELLAR_*` environment overrides) which registers workspaces and the
//! provider catalog, and the per-workspace manifest (`cellar.toml` at the
//! workspace root) which declares the templates cells are built from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::ServiceDefinition;

/// Name of the per-workspace manifest file.
pub const WORKSPACE_MANIFEST: &str = "cellar.toml";

/// Workspace/template/config resolution failure at the request boundary.
#[derive(Debug, Error)]
pub enum WorkspaceContextResolutionError {
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("workspace manifest missing: {}", .0.display())]
    ManifestMissing(PathBuf),

    #[error("workspace manifest invalid: {path}: {message}")]
    ManifestInvalid { path: PathBuf, message: String },

    #[error("template not found: {template_id} (workspace {workspace_id})")]
    TemplateNotFound {
        template_id: String,
        workspace_id: String,
    },
}

/// A registered workspace (a checkout cells are carved out of).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Stable workspace ID used in routes.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Path to the workspace root checkout.
    pub root: PathBuf,
}

/// An entry in the provider catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider ID (e.g. "anthropic").
    pub id: String,
    /// Model used when nothing more specific is configured.
    pub default_model: String,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the sqlite database file.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Base port for the shared service port pool.
    #[serde(default = "default_base_port")]
    pub service_base_port: u16,
    /// Registered workspaces.
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
    /// Provider catalog for agent model fallback.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    /// Allowed CORS origins.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4814
}

fn default_base_port() -> u16 {
    42820
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: None,
            service_base_port: default_base_port(),
            workspaces: Vec::new(),
            providers: Vec::new(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional file path plus `CELLAR_*`
    /// environment overrides.
    ///
    /// When no explicit path is given, `$XDG_CONFIG_HOME/cellar/config.toml`
    /// is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        let resolved = match path {
            Some(p) => Some(expand_path(p)),
            None => dirs::config_dir()
                .map(|d| d.join("cellar").join("config.toml"))
                .filter(|p| p.exists()),
        };

        if let Some(file) = resolved {
            builder = builder.add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(Environment::with_prefix("CELLAR").separator("__"))
            .build()
            .context("building configuration")?;

        settings
            .try_deserialize::<ServerConfig>()
            .context("deserializing configuration")
    }

    /// Resolve the database path, defaulting to the user data directory.
    pub fn resolve_database_path(&self) -> PathBuf {
        if let Some(ref path) = self.database_path {
            return expand_path(path);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cellar")
            .join("cellar.db")
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

/// Agent defaults declared by a template or workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// A template: setup commands, services, and agent defaults for new cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Stable template ID referenced by create-cell requests.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Setup commands run in the worktree, in order, via `sh -c`.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Services supervised for the cell's lifetime.
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
    /// Agent session defaults.
    #[serde(default)]
    pub agent: AgentDefaults,
}

/// Parsed per-workspace manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Workspace-level agent defaults (fallback below template defaults).
    #[serde(default)]
    pub defaults: AgentDefaults,
    /// Declared templates.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

impl WorkspaceConfig {
    /// Find a template by ID.
    pub fn template(&self, template_id: &str) -> Option<&TemplateConfig> {
        self.templates.iter().find(|t| t.id == template_id)
    }
}

/// Registry of workspaces plus manifest loading.
#[derive(Debug, Clone)]
pub struct WorkspaceRegistry {
    workspaces: Vec<WorkspaceEntry>,
}

impl WorkspaceRegistry {
    /// Create a registry from configured workspace entries.
    pub fn new(workspaces: Vec<WorkspaceEntry>) -> Self {
        Self { workspaces }
    }

    /// Look up a workspace by ID.
    pub fn get(&self, workspace_id: &str) -> Result<&WorkspaceEntry, WorkspaceContextResolutionError> {
        self.workspaces
            .iter()
            .find(|w| w.id == workspace_id)
            .ok_or_else(|| {
                WorkspaceContextResolutionError::WorkspaceNotFound(workspace_id.to_string())
            })
    }

    /// All registered workspaces.
    pub fn list(&self) -> &[WorkspaceEntry] {
        &self.workspaces
    }

    /// Load and parse the workspace manifest (`cellar.toml`).
    pub fn load_config(
        &self,
        workspace_id: &str,
    ) -> Result<WorkspaceConfig, WorkspaceContextResolutionError> {
        let entry = self.get(workspace_id)?;
        let manifest_path = entry.root.join(WORKSPACE_MANIFEST);

        let contents = std::fs::read_to_string(&manifest_path)
            .map_err(|_| WorkspaceContextResolutionError::ManifestMissing(manifest_path.clone()))?;

        toml::from_str(&contents).map_err(|e| WorkspaceContextResolutionError::ManifestInvalid {
            path: manifest_path,
            message: e.to_string(),
        })
    }

    /// Resolve a template within a workspace.
    pub fn resolve_template(
        &self,
        workspace_id: &str,
        template_id: &str,
    ) -> Result<(WorkspaceConfig, TemplateConfig), WorkspaceContextResolutionError> {
        let config = self.load_config(workspace_id)?;
        let template = config.template(template_id).cloned().ok_or_else(|| {
            WorkspaceContextResolutionError::TemplateNotFound {
                template_id: template_id.to_string(),
                workspace_id: workspace_id.to_string(),
            }
        })?;
        Ok((config, template))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workspace_manifest() {
        let manifest = r#"
            [defaults]
            provider = "anthropic"
            model = "claude-sonnet"

            [[templates]]
            id = "web"
            name = "Web app"
            setup = ["true"]

            [templates.agent]
            model = "claude-opus"

            [[templates.services]]
            name = "dev"
            command = "sleep 60"

            [[templates.services]]
            name = "api"
            command = "sleep 60"
            type = "process"
            ready_timeout_ms = 5000
        "#;

        let config: WorkspaceConfig = toml::from_str(manifest).unwrap();
        assert_eq!(config.defaults.provider.as_deref(), Some("anthropic"));
        let template = config.template("web").unwrap();
        assert_eq!(template.services.len(), 2);
        assert_eq!(template.services[1].ready_timeout_ms, 5000);
        assert_eq!(template.agent.model.as_deref(), Some("claude-opus"));
        assert!(config.template("missing").is_none());
    }

    #[test]
    fn registry_rejects_unknown_workspace() {
        let registry = WorkspaceRegistry::new(vec![]);
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(
            err,
            WorkspaceContextResolutionError::WorkspaceNotFound(_)
        ));
    }
}
