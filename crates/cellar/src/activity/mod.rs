//! Append-only per-cell activity feed.
//!
//! Written by the orchestrator and the service supervisor, read by clients
//! for audit and testing. Events are never mutated or deleted.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

/// A recorded state-changing action on a cell.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityEvent {
    /// Monotonic event ID.
    pub id: i64,
    /// Owning cell.
    pub cell_id: String,
    /// Event type, e.g. `service.start`, `services.stop`, `setup.retry`.
    pub event_type: String,
    /// When the event was appended.
    pub timestamp: String,
    /// Event payload, JSON-encoded.
    pub payload: String,
}

impl ActivityEvent {
    /// Decode the payload column.
    pub fn payload_value(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or(Value::Null)
    }
}

/// Repository for the append-only activity feed.
#[derive(Debug, Clone)]
pub struct ActivityRepository {
    pool: SqlitePool,
}

impl ActivityRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event.
    pub async fn append(&self, cell_id: &str, event_type: &str, payload: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_events (cell_id, event_type, timestamp, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(cell_id)
        .bind(event_type)
        .bind(Utc::now().to_rfc3339())
        .bind(payload.to_string())
        .execute(&self.pool)
        .await
        .context("appending activity event")?;

        Ok(())
    }

    /// List all events of a cell in append order.
    pub async fn list_for_cell(&self, cell_id: &str) -> Result<Vec<ActivityEvent>> {
        let events = sqlx::query_as::<_, ActivityEvent>(
            "SELECT id, cell_id, event_type, timestamp, payload \
             FROM activity_events WHERE cell_id = ? ORDER BY id",
        )
        .bind(cell_id)
        .fetch_all(&self.pool)
        .await
        .context("listing activity events")?;

        Ok(events)
    }

    /// Count events of a given type for a cell.
    pub async fn count_for_cell(&self, cell_id: &str, event_type: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM activity_events WHERE cell_id = ? AND event_type = ?",
        )
        .bind(cell_id)
        .bind(event_type)
        .fetch_one(&self.pool)
        .await
        .context("counting activity events")?;

        Ok(count)
    }
}
