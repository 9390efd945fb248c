//! Cell database repository.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{Cell, CellProvisioningState, CellStatus};

const CELL_COLUMNS: &str = "id, name, description, template_id, workspace_id, workspace_path, \
     workspace_root_path, branch_name, base_commit, status, phase, last_setup_error, created_at";

/// Repository for cell persistence.
#[derive(Debug, Clone)]
pub struct CellRepository {
    pool: SqlitePool,
}

impl CellRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a cell and its paired provisioning-state row in one transaction.
    pub async fn create(&self, cell: &Cell, state: &CellProvisioningState) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            INSERT INTO cells (
                id, name, description, template_id, workspace_id, workspace_path,
                workspace_root_path, branch_name, base_commit, status, phase,
                last_setup_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cell.id)
        .bind(&cell.name)
        .bind(&cell.description)
        .bind(&cell.template_id)
        .bind(&cell.workspace_id)
        .bind(&cell.workspace_path)
        .bind(&cell.workspace_root_path)
        .bind(&cell.branch_name)
        .bind(&cell.base_commit)
        .bind(cell.status.to_string())
        .bind(cell.phase.to_string())
        .bind(&cell.last_setup_error)
        .bind(&cell.created_at)
        .execute(&mut *tx)
        .await
        .context("creating cell")?;

        sqlx::query(
            r#"
            INSERT INTO cell_provisioning_state (
                cell_id, model_id_override, provider_id_override,
                attempt_count, started_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.cell_id)
        .bind(&state.model_id_override)
        .bind(&state.provider_id_override)
        .bind(state.attempt_count)
        .bind(&state.started_at)
        .bind(&state.finished_at)
        .execute(&mut *tx)
        .await
        .context("creating provisioning state")?;

        tx.commit().await.context("committing cell creation")?;
        Ok(())
    }

    /// Get a cell by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Cell>> {
        let cell = sqlx::query_as::<_, Cell>(&format!(
            "SELECT {CELL_COLUMNS} FROM cells WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching cell")?;

        Ok(cell)
    }

    /// List all cells, newest first.
    pub async fn list(&self) -> Result<Vec<Cell>> {
        let cells = sqlx::query_as::<_, Cell>(&format!(
            "SELECT {CELL_COLUMNS} FROM cells ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing cells")?;

        Ok(cells)
    }

    /// List cells in a workspace, newest first.
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Cell>> {
        let cells = sqlx::query_as::<_, Cell>(&format!(
            "SELECT {CELL_COLUMNS} FROM cells WHERE workspace_id = ? ORDER BY created_at DESC"
        ))
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("listing cells for workspace")?;

        Ok(cells)
    }

    /// List cells stranded mid-provisioning (status = spawning).
    pub async fn list_spawning(&self) -> Result<Vec<Cell>> {
        let cells = sqlx::query_as::<_, Cell>(&format!(
            "SELECT {CELL_COLUMNS} FROM cells WHERE status = 'spawning' ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing spawning cells")?;

        Ok(cells)
    }

    /// Update cell status.
    pub async fn update_status(&self, id: &str, status: CellStatus) -> Result<()> {
        sqlx::query("UPDATE cells SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating cell status")?;

        Ok(())
    }

    /// Record the created worktree on the cell row.
    pub async fn set_worktree(
        &self,
        id: &str,
        path: &str,
        branch: &str,
        base_commit: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE cells SET workspace_path = ?, branch_name = ?, base_commit = ? WHERE id = ?",
        )
        .bind(path)
        .bind(branch)
        .bind(base_commit)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("recording worktree")?;

        Ok(())
    }

    /// Mark a cell ready, clearing any previous setup error.
    pub async fn mark_ready(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE cells SET status = 'ready', last_setup_error = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking cell ready")?;

        Ok(())
    }

    /// Mark a cell errored with the failure message stored verbatim.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query("UPDATE cells SET status = 'error', last_setup_error = ? WHERE id = ?")
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking cell errored")?;

        Ok(())
    }

    /// Delete a cell; dependent rows cascade.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM cells WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting cell")?;

        Ok(())
    }

    /// Fetch the provisioning state of a cell.
    pub async fn provisioning_state(&self, cell_id: &str) -> Result<Option<CellProvisioningState>> {
        let state = sqlx::query_as::<_, CellProvisioningState>(
            "SELECT cell_id, model_id_override, provider_id_override, attempt_count, \
             started_at, finished_at FROM cell_provisioning_state WHERE cell_id = ?",
        )
        .bind(cell_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching provisioning state")?;

        Ok(state)
    }

    /// Start a new provisioning attempt: bump the counter and reset the
    /// bracket timestamps.
    pub async fn begin_provisioning_attempt(&self, cell_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cell_provisioning_state SET attempt_count = attempt_count + 1, \
             started_at = ?, finished_at = NULL WHERE cell_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cell_id)
        .execute(&self.pool)
        .await
        .context("beginning provisioning attempt")?;

        Ok(())
    }

    /// Close the current provisioning attempt.
    pub async fn finish_provisioning_attempt(&self, cell_id: &str) -> Result<()> {
        sqlx::query("UPDATE cell_provisioning_state SET finished_at = ? WHERE cell_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(cell_id)
            .execute(&self.pool)
            .await
            .context("finishing provisioning attempt")?;

        Ok(())
    }
}
