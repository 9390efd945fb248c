//! API request handlers for cells, services, and the activity feed.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::activity::ActivityEvent;
use crate::cell::{Cell, CellProvisioningState, CreateCellRequest};
use crate::service::CellService;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Cell plus its provisioning bookkeeping.
#[derive(Debug, Serialize)]
pub struct CellDetail {
    #[serde(flatten)]
    pub cell: Cell,
    pub provisioning: Option<CellProvisioningState>,
}

/// Create a cell. Returns 201 with `status: "spawning"` immediately; the
/// provisioning workflow runs detached.
#[instrument(skip(state, request))]
pub async fn create_cell(
    State(state): State<AppState>,
    Json(request): Json<CreateCellRequest>,
) -> ApiResult<(StatusCode, Json<Cell>)> {
    let cell = state.orchestrator.create_cell(request).await?;
    info!(cell_id = %cell.id, template_id = %cell.template_id, "Cell created");
    Ok((StatusCode::CREATED, Json(cell)))
}

/// Query parameters for cell listing.
#[derive(Debug, Deserialize)]
pub struct ListCellsQuery {
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// List cells, optionally filtered by workspace.
#[instrument(skip(state))]
pub async fn list_cells(
    State(state): State<AppState>,
    Query(query): Query<ListCellsQuery>,
) -> ApiResult<Json<Vec<Cell>>> {
    let cells = match query.workspace_id {
        Some(ref workspace_id) => state.cells.list_for_workspace(workspace_id).await?,
        None => state.cells.list().await?,
    };
    Ok(Json(cells))
}

/// Get a cell with its provisioning state.
#[instrument(skip(state))]
pub async fn get_cell(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<CellDetail>> {
    let cell = state
        .cells
        .get(&cell_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("cell not found: {}", cell_id)))?;
    let provisioning = state.cells.provisioning_state(&cell_id).await?;

    Ok(Json(CellDetail { cell, provisioning }))
}

/// Delete a cell. 400 unless the cell is archived.
#[instrument(skip(state))]
pub async fn delete_cell(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete(&cell_id).await?;
    info!(cell_id = %cell_id, "Cell deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Archive a ready cell.
#[instrument(skip(state))]
pub async fn archive_cell(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Cell>> {
    let cell = state.orchestrator.archive(&cell_id).await?;
    Ok(Json(cell))
}

/// Restore an archived cell.
#[instrument(skip(state))]
pub async fn restore_cell(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Cell>> {
    let cell = state.orchestrator.restore(&cell_id).await?;
    Ok(Json(cell))
}

/// Re-run template setup for an errored cell.
#[instrument(skip(state))]
pub async fn retry_setup(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Cell>> {
    let cell = state.orchestrator.retry_setup(&cell_id).await?;
    Ok(Json(cell))
}

/// List a cell's services.
#[instrument(skip(state))]
pub async fn list_services(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Vec<CellService>>> {
    ensure_cell_exists(&state, &cell_id).await?;
    let services = state.supervisor.list_services(&cell_id).await?;
    Ok(Json(services))
}

/// Body for stop requests.
#[derive(Debug, Default, Deserialize)]
pub struct StopServiceRequest {
    /// Return the port(s) to the shared pool. Transient restarts keep them.
    #[serde(default)]
    pub release_ports: bool,
}

/// Start a single service.
#[instrument(skip(state))]
pub async fn start_service(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
) -> ApiResult<Json<CellService>> {
    ensure_service_in_cell(&state, &cell_id, &service_id).await?;
    let service = state.supervisor.start_service_by_id(&service_id).await?;
    Ok(Json(service))
}

/// Stop a single service.
#[instrument(skip(state, body))]
pub async fn stop_service(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
    body: Option<Json<StopServiceRequest>>,
) -> ApiResult<Json<CellService>> {
    ensure_service_in_cell(&state, &cell_id, &service_id).await?;
    let release = body.map(|Json(b)| b.release_ports).unwrap_or(false);
    let service = state
        .supervisor
        .stop_service_by_id(&service_id, release)
        .await?;
    Ok(Json(service))
}

/// Restart a single service, preserving its definition and port.
#[instrument(skip(state))]
pub async fn restart_service(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
) -> ApiResult<Json<CellService>> {
    ensure_service_in_cell(&state, &cell_id, &service_id).await?;
    let service = state.supervisor.restart_service_by_id(&service_id).await?;
    Ok(Json(service))
}

/// Start all of a cell's services.
#[instrument(skip(state))]
pub async fn start_services(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Vec<CellService>>> {
    ensure_cell_exists(&state, &cell_id).await?;
    let services = state.supervisor.start_services_for_cell(&cell_id).await?;
    Ok(Json(services))
}

/// Stop all of a cell's services.
#[instrument(skip(state, body))]
pub async fn stop_services(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    body: Option<Json<StopServiceRequest>>,
) -> ApiResult<Json<Vec<CellService>>> {
    let cell = ensure_cell_exists(&state, &cell_id).await?;
    if !cell.is_operable() {
        return Err(ApiError::bad_request(format!(
            "cannot stop services: cell {} is archived",
            cell_id
        )));
    }
    let release = body.map(|Json(b)| b.release_ports).unwrap_or(false);
    let services = state
        .supervisor
        .stop_services_for_cell(&cell_id, release)
        .await?;
    Ok(Json(services))
}

/// Restart all of a cell's services.
#[instrument(skip(state))]
pub async fn restart_services(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Vec<CellService>>> {
    ensure_cell_exists(&state, &cell_id).await?;
    let services = state
        .supervisor
        .restart_services_for_cell(&cell_id)
        .await?;
    Ok(Json(services))
}

/// Append-only activity feed of a cell.
#[instrument(skip(state))]
pub async fn cell_activity(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> ApiResult<Json<Vec<ActivityEvent>>> {
    ensure_cell_exists(&state, &cell_id).await?;
    let events = state.activity.list_for_cell(&cell_id).await?;
    Ok(Json(events))
}

pub(super) async fn ensure_cell_exists(state: &AppState, cell_id: &str) -> ApiResult<Cell> {
    state
        .cells
        .get(cell_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("cell not found: {}", cell_id)))
}

async fn ensure_service_in_cell(
    state: &AppState,
    cell_id: &str,
    service_id: &str,
) -> ApiResult<()> {
    let service = state
        .supervisor
        .get_service(service_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("service not found: {}", service_id)))?;

    if service.cell_id != cell_id {
        return Err(ApiError::not_found(format!(
            "service not found in cell {}: {}",
            cell_id, service_id
        )));
    }
    Ok(())
}
