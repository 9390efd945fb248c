//! Service database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::CellService;

const SERVICE_COLUMNS: &str = "id, cell_id, name, service_type, command, cwd, env, status, \
     port, pid, ready_timeout_ms, last_known_error, definition, created_at, updated_at";

/// Repository for service persistence.
#[derive(Debug, Clone)]
pub struct ServiceRepository {
    pool: SqlitePool,
}

impl ServiceRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new service row.
    pub async fn create(&self, service: &CellService) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cell_services (
                id, cell_id, name, service_type, command, cwd, env, status,
                port, pid, ready_timeout_ms, last_known_error, definition,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&service.id)
        .bind(&service.cell_id)
        .bind(&service.name)
        .bind(service.service_type.to_string())
        .bind(&service.command)
        .bind(&service.cwd)
        .bind(&service.env)
        .bind(service.status.to_string())
        .bind(service.port)
        .bind(service.pid)
        .bind(service.ready_timeout_ms)
        .bind(&service.last_known_error)
        .bind(&service.definition)
        .bind(&service.created_at)
        .bind(&service.updated_at)
        .execute(&self.pool)
        .await
        .context("creating service")?;

        Ok(())
    }

    /// Get a service by ID.
    pub async fn get(&self, id: &str) -> Result<Option<CellService>> {
        let service = sqlx::query_as::<_, CellService>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM cell_services WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching service")?;

        Ok(service)
    }

    /// Find a service by cell and name (the find-or-create key).
    pub async fn find_by_name(&self, cell_id: &str, name: &str) -> Result<Option<CellService>> {
        let service = sqlx::query_as::<_, CellService>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM cell_services WHERE cell_id = ? AND name = ?"
        ))
        .bind(cell_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching service by name")?;

        Ok(service)
    }

    /// List all services of a cell.
    pub async fn list_for_cell(&self, cell_id: &str) -> Result<Vec<CellService>> {
        let services = sqlx::query_as::<_, CellService>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM cell_services WHERE cell_id = ? ORDER BY name"
        ))
        .bind(cell_id)
        .fetch_all(&self.pool)
        .await
        .context("listing services")?;

        Ok(services)
    }

    /// Mark a service as starting with its process ID and allocated port.
    pub async fn mark_starting(&self, id: &str, pid: i64, port: Option<i64>) -> Result<()> {
        sqlx::query(
            "UPDATE cell_services SET status = 'starting', pid = ?, port = ?, \
             last_known_error = NULL, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(pid)
        .bind(port)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking service starting")?;

        Ok(())
    }

    /// Mark a service as running.
    pub async fn mark_running(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cell_services SET status = 'running', updated_at = datetime('now') WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking service running")?;

        Ok(())
    }

    /// Mark a service as stopped, clearing the pid. The port is released
    /// (set NULL) only when `release_port` is set; transient restarts keep it.
    pub async fn mark_stopped(&self, id: &str, release_port: bool) -> Result<()> {
        let sql = if release_port {
            "UPDATE cell_services SET status = 'stopped', pid = NULL, port = NULL, \
             updated_at = datetime('now') WHERE id = ?"
        } else {
            "UPDATE cell_services SET status = 'stopped', pid = NULL, \
             updated_at = datetime('now') WHERE id = ?"
        };

        sqlx::query(sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking service stopped")?;

        Ok(())
    }

    /// Record a service failure: status becomes error and the pid is cleared.
    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cell_services SET status = 'error', pid = NULL, last_known_error = ?, \
             updated_at = datetime('now') WHERE id = ?",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("marking service errored")?;

        Ok(())
    }

    /// Ports currently held by live (starting/running) services, plus ports
    /// still assigned to errored services awaiting a restart.
    pub async fn held_ports(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT port FROM cell_services WHERE port IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("fetching held ports")?;

        Ok(rows.into_iter().map(|(port,)| port).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use crate::cell::{Cell, CellPhase, CellProvisioningState, CellRepository, CellStatus};
    use crate::db::Database;

    use super::super::models::{ServiceStatus, ServiceType};
    use super::*;

    async fn seeded_repo() -> (ServiceRepository, String) {
        let db = Database::in_memory().await.unwrap();
        let cells = CellRepository::new(db.pool().clone());

        let cell_id = Uuid::new_v4().to_string();
        let cell = Cell {
            id: cell_id.clone(),
            name: "test".to_string(),
            description: String::new(),
            template_id: "t".to_string(),
            workspace_id: "w".to_string(),
            workspace_path: None,
            workspace_root_path: "/tmp".to_string(),
            branch_name: None,
            base_commit: None,
            status: CellStatus::Ready,
            phase: CellPhase::Planning,
            last_setup_error: None,
            created_at: Utc::now().to_rfc3339(),
        };
        let state = CellProvisioningState {
            cell_id: cell_id.clone(),
            model_id_override: None,
            provider_id_override: None,
            attempt_count: 1,
            started_at: Utc::now().to_rfc3339(),
            finished_at: None,
        };
        cells.create(&cell, &state).await.unwrap();

        let repo = ServiceRepository::new(db.pool().clone());
        let now = Utc::now().to_rfc3339();
        let service = CellService {
            id: "svc-1".to_string(),
            cell_id,
            name: "dev".to_string(),
            service_type: ServiceType::Process,
            command: "sleep 60".to_string(),
            cwd: "/tmp".to_string(),
            env: "{}".to_string(),
            status: ServiceStatus::Stopped,
            port: None,
            pid: None,
            ready_timeout_ms: 1000,
            last_known_error: None,
            definition: "{}".to_string(),
            created_at: now.clone(),
            updated_at: now,
        };
        repo.create(&service).await.unwrap();

        (repo, "svc-1".to_string())
    }

    #[tokio::test]
    async fn transient_stop_keeps_the_port() {
        let (repo, id) = seeded_repo().await;

        repo.mark_starting(&id, 123, Some(45000)).await.unwrap();
        repo.mark_stopped(&id, false).await.unwrap();

        let service = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(service.status, ServiceStatus::Stopped);
        assert_eq!(service.pid, None);
        assert_eq!(service.port, Some(45000));
        assert_eq!(repo.held_ports().await.unwrap(), vec![45000]);
    }

    #[tokio::test]
    async fn releasing_stop_returns_the_port() {
        let (repo, id) = seeded_repo().await;

        repo.mark_starting(&id, 123, Some(45001)).await.unwrap();
        repo.mark_stopped(&id, true).await.unwrap();

        let service = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(service.port, None);
        assert!(repo.held_ports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_error_clears_pid_but_keeps_port() {
        let (repo, id) = seeded_repo().await;

        repo.mark_starting(&id, 123, Some(45002)).await.unwrap();
        repo.mark_error(&id, "process exited unexpectedly")
            .await
            .unwrap();

        let service = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(service.status, ServiceStatus::Error);
        assert_eq!(service.pid, None);
        assert_eq!(service.port, Some(45002));
        assert_eq!(
            service.last_known_error.as_deref(),
            Some("process exited unexpectedly")
        );
    }

    #[tokio::test]
    async fn find_by_name_is_the_idempotency_key() {
        let (repo, _) = seeded_repo().await;

        let service = repo.get("svc-1").await.unwrap().unwrap();
        let found = repo
            .find_by_name(&service.cell_id, "dev")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "svc-1");

        assert!(
            repo.find_by_name(&service.cell_id, "missing")
                .await
                .unwrap()
                .is_none()
        );
    }
}
