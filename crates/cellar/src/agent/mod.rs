//! Agent runtime collaborator contract.
//!
//! The coding agent itself is an external program; this module owns only the
//! call contract the orchestrator needs (ensure/send/close) plus the session
//! records it consumes. The default implementation keeps session rows in
//! sqlite and appends prompts to a transcript file inside the worktree; the
//! interactive agent CLI runs in the cell's chat terminal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Resolved model/provider selection for a new agent session.
#[derive(Debug, Clone)]
pub struct AgentSessionSpec {
    pub template_id: String,
    pub provider: String,
    pub model_id: String,
    /// Worktree the session is rooted in.
    pub worktree_path: PathBuf,
}

/// A coding-agent session record (consumed, not owned, by the supervisor).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentSessionRecord {
    /// Unique session ID.
    pub id: String,
    /// Owning cell.
    pub cell_id: String,
    /// Template the session was created for.
    pub template_id: String,
    /// Provider ID.
    pub provider: String,
    /// Model ID.
    pub model_id: String,
    /// "open" or "closed".
    pub status: String,
    /// When the session was created.
    pub created_at: String,
}

/// Creates, messages, and closes per-cell agent sessions.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Return the cell's open session, creating one if needed.
    async fn ensure_agent_session(
        &self,
        cell_id: &str,
        spec: &AgentSessionSpec,
    ) -> Result<AgentSessionRecord>;

    /// Send a message to an agent session.
    async fn send_agent_message(&self, session_id: &str, content: &str) -> Result<()>;

    /// Close the cell's open session, if any.
    async fn close_agent_session(&self, cell_id: &str) -> Result<()>;
}

/// Repository for agent session rows.
#[derive(Debug, Clone)]
pub struct AgentSessionRepository {
    pool: SqlitePool,
}

impl AgentSessionRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The cell's open session, if one exists.
    pub async fn find_open(&self, cell_id: &str) -> Result<Option<AgentSessionRecord>> {
        let record = sqlx::query_as::<_, AgentSessionRecord>(
            "SELECT id, cell_id, template_id, provider, model_id, status, created_at \
             FROM agent_sessions WHERE cell_id = ? AND status = 'open'",
        )
        .bind(cell_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching open agent session")?;

        Ok(record)
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<AgentSessionRecord>> {
        let record = sqlx::query_as::<_, AgentSessionRecord>(
            "SELECT id, cell_id, template_id, provider, model_id, status, created_at \
             FROM agent_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching agent session")?;

        Ok(record)
    }

    /// Insert a new session row.
    pub async fn create(&self, record: &AgentSessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_sessions (id, cell_id, template_id, provider, model_id, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.cell_id)
        .bind(&record.template_id)
        .bind(&record.provider)
        .bind(&record.model_id)
        .bind(&record.status)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .context("creating agent session")?;

        Ok(())
    }

    /// Close every open session of a cell.
    pub async fn close_for_cell(&self, cell_id: &str) -> Result<()> {
        sqlx::query("UPDATE agent_sessions SET status = 'closed' WHERE cell_id = ? AND status = 'open'")
            .bind(cell_id)
            .execute(&self.pool)
            .await
            .context("closing agent sessions")?;

        Ok(())
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Default runtime: session rows in sqlite, prompts appended to a transcript
/// file inside the worktree.
pub struct LocalAgentRuntime {
    repo: AgentSessionRepository,
}

/// Transcript file written under the worktree.
const TRANSCRIPT_PATH: &str = ".cellar/agent-transcript.log";

impl LocalAgentRuntime {
    /// Create a runtime over the given session repository.
    pub fn new(repo: AgentSessionRepository) -> Self {
        Self { repo }
    }

    async fn transcript_path(&self, session: &AgentSessionRecord) -> Result<Option<PathBuf>> {
        // Sends only carry a session ID, so the worktree comes from the cell
        // row. Sessions of deleted cells simply have nowhere to write.
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT workspace_path FROM cells WHERE id = ?")
                .bind(&session.cell_id)
                .fetch_optional(self.repo.pool())
                .await
                .context("resolving worktree for transcript")?;

        Ok(row
            .and_then(|(path,)| path)
            .map(|p| PathBuf::from(p).join(TRANSCRIPT_PATH)))
    }
}

#[async_trait]
impl AgentRuntime for LocalAgentRuntime {
    async fn ensure_agent_session(
        &self,
        cell_id: &str,
        spec: &AgentSessionSpec,
    ) -> Result<AgentSessionRecord> {
        if let Some(existing) = self.repo.find_open(cell_id).await? {
            return Ok(existing);
        }

        let record = AgentSessionRecord {
            id: Uuid::new_v4().to_string(),
            cell_id: cell_id.to_string(),
            template_id: spec.template_id.clone(),
            provider: spec.provider.clone(),
            model_id: spec.model_id.clone(),
            status: "open".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.repo.create(&record).await?;

        info!(
            "Opened agent session {} for cell {} ({}/{})",
            record.id, cell_id, record.provider, record.model_id
        );
        Ok(record)
    }

    async fn send_agent_message(&self, session_id: &str, content: &str) -> Result<()> {
        let session = self
            .repo
            .get(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("agent session not found: {}", session_id))?;

        if session.status != "open" {
            anyhow::bail!("agent session is closed: {}", session_id);
        }

        if let Some(path) = self.transcript_path(&session).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("creating transcript directory")?;
            }
            let line = format!("[{}] user: {}\n", Utc::now().to_rfc3339(), content);
            let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            existing.push_str(&line);
            tokio::fs::write(&path, existing)
                .await
                .context("appending to agent transcript")?;
        }

        Ok(())
    }

    async fn close_agent_session(&self, cell_id: &str) -> Result<()> {
        self.repo.close_for_cell(cell_id).await?;
        info!("Closed agent sessions for cell {}", cell_id);
        Ok(())
    }
}
