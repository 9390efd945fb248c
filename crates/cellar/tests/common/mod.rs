//! Test utilities and common setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request},
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use cellar::activity::ActivityRepository;
use cellar::agent::{AgentSessionRepository, LocalAgentRuntime};
use cellar::api::{AppState, create_router};
use cellar::cell::{Cell, CellOrchestrator, CellRepository};
use cellar::config::{ProviderEntry, WorkspaceEntry, WorkspaceRegistry};
use cellar::db::Database;
use cellar::service::{PortAllocator, ServiceRepository, ServiceSupervisor};
use cellar::terminal::TerminalMultiplexer;
use cellar::worktree::{WorktreeInfo, WorktreeManager};

/// Workspace manifest used across the integration tests.
const TEST_MANIFEST: &str = r#"
[defaults]
provider = "anthropic"
model = "claude-sonnet"

[[templates]]
id = "two-service"
name = "Two services"

[[templates.services]]
name = "alpha"
command = "sleep 60"

[[templates.services]]
name = "beta"
command = "sleep 60"

[[templates]]
id = "failing-setup"
setup = ["exit 42"]

[[templates]]
id = "empty"
"#;

/// Worktree manager double: plain directories instead of git worktrees,
/// with a removal counter for exactly-once assertions.
pub struct StubWorktreeManager {
    root: PathBuf,
    removals: AtomicUsize,
}

impl StubWorktreeManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            removals: AtomicUsize::new(0),
        }
    }

    pub fn removal_count(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorktreeManager for StubWorktreeManager {
    async fn create_worktree(&self, cell: &Cell) -> Result<WorktreeInfo> {
        let path = self.root.join(&cell.id);
        std::fs::create_dir_all(&path)?;
        Ok(WorktreeInfo {
            path,
            branch: format!("cellar/{}", cell.name),
            base_commit: "0000000000000000000000000000000000000000".to_string(),
        })
    }

    async fn remove_worktree(&self, cell: &Cell) -> Result<()> {
        self.removals.fetch_add(1, Ordering::SeqCst);
        if let Some(ref path) = cell.workspace_path {
            let _ = std::fs::remove_dir_all(path);
        }
        Ok(())
    }
}

/// Everything a test needs: the router plus direct handles for assertions.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub worktrees: Arc<StubWorktreeManager>,
    /// Keeps the workspace directory alive for the test's duration.
    #[allow(dead_code)]
    pub workspace_dir: TempDir,
}

/// Create a test application with an in-memory database and a temp
/// workspace carrying the standard test manifest.
pub async fn test_app() -> TestApp {
    let workspace_dir = TempDir::new().unwrap();
    std::fs::write(workspace_dir.path().join("cellar.toml"), TEST_MANIFEST).unwrap();

    let db = Database::in_memory().await.unwrap();

    let cells = CellRepository::new(db.pool().clone());
    let services = ServiceRepository::new(db.pool().clone());
    let activity = ActivityRepository::new(db.pool().clone());
    let agent_sessions = AgentSessionRepository::new(db.pool().clone());

    let ports = PortAllocator::new(services.clone(), 44_000);
    let supervisor = ServiceSupervisor::new(services, cells.clone(), activity.clone(), ports);

    let worktrees = Arc::new(StubWorktreeManager::new(
        workspace_dir.path().join("worktrees"),
    ));
    let agents = Arc::new(LocalAgentRuntime::new(agent_sessions));

    let registry = WorkspaceRegistry::new(vec![WorkspaceEntry {
        id: "ws-1".to_string(),
        name: Some("Test workspace".to_string()),
        root: workspace_dir.path().to_path_buf(),
    }]);
    let providers = vec![ProviderEntry {
        id: "anthropic".to_string(),
        default_model: "claude-sonnet".to_string(),
    }];

    let terminals = TerminalMultiplexer::default();
    let orchestrator = CellOrchestrator::new(
        cells.clone(),
        registry.clone(),
        providers,
        supervisor.clone(),
        worktrees.clone(),
        agents,
        activity.clone(),
        terminals.clone(),
    );

    let state = AppState::new(orchestrator, supervisor, terminals, activity, registry, cells);
    let router = create_router(state.clone());

    TestApp {
        router,
        state,
        worktrees,
        workspace_dir,
    }
}

impl TestApp {
    /// Issue a request and return (status, parsed JSON body).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (axum::http::StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        (status, json)
    }

    /// Poll a cell until its status matches, failing after a few seconds.
    pub async fn wait_for_cell_status(&self, cell_id: &str, expected: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, body) = self
                .request(Method::GET, &format!("/api/cells/{}", cell_id), None)
                .await;
            assert!(status.is_success(), "cell fetch failed: {status} {body}");

            if body["status"] == expected {
                return body;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "cell {} never reached status {} (currently {})",
                    cell_id, expected, body["status"]
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Create a cell from a template and return its JSON body.
    pub async fn create_cell(&self, template_id: &str, description: Option<&str>) -> Value {
        let mut body = serde_json::json!({
            "template_id": template_id,
            "workspace_id": "ws-1",
        });
        if let Some(desc) = description {
            body["description"] = Value::String(desc.to_string());
        }

        let (status, json) = self.request(Method::POST, "/api/cells", Some(body)).await;
        assert_eq!(status, axum::http::StatusCode::CREATED, "create failed: {json}");
        assert_eq!(json["status"], "spawning");
        json
    }
}
