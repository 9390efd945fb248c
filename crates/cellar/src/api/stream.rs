//! Event-stream handlers: terminal streaming and workspace cell updates.
//!
//! Terminal streams follow a fixed wire contract: a `ready` event with
//! session metadata, a `snapshot` event with the current buffer, then `data`
//! events in emission order until the process exits or the session is
//! restarted. Clients track liveness via the monotonically increasing
//! `seq` counter and cumulative output length carried in the events.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tracing::{debug, instrument, warn};

use crate::cell::Cell;
use crate::terminal::{
    SpawnSpec, TerminalEvent, TerminalKey, TerminalKind, TerminalSessionInfo, TerminalStatus,
    spawn_spec_for,
};

use super::error::{ApiError, ApiResult};
use super::handlers::ensure_cell_exists;
use super::state::AppState;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Optional terminal size carried on stream/restart requests.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalSizeQuery {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

impl TerminalSizeQuery {
    fn dimensions(&self) -> (u16, u16) {
        (
            self.cols.unwrap_or(DEFAULT_COLS),
            self.rows.unwrap_or(DEFAULT_ROWS),
        )
    }
}

/// Body for terminal input.
#[derive(Debug, Deserialize)]
pub struct TerminalInputRequest {
    pub data: String,
}

/// Body for terminal resize.
#[derive(Debug, Deserialize)]
pub struct TerminalResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

/// Resolve the key and spawn spec for a terminal kind within a cell.
///
/// Archived cells admit no terminal-session operations.
async fn resolve_terminal(
    state: &AppState,
    cell_id: &str,
    kind: TerminalKind,
    service_id: Option<&str>,
) -> ApiResult<(TerminalKey, SpawnSpec, Cell)> {
    let cell = ensure_cell_exists(state, cell_id).await?;
    if !cell.is_operable() {
        return Err(ApiError::bad_request(format!(
            "cannot open terminal: cell {} is archived",
            cell_id
        )));
    }

    let (key, spec) = match kind {
        TerminalKind::Cell => (
            TerminalKey::cell(cell_id),
            spawn_spec_for(kind, &cell, None, None)?,
        ),
        TerminalKind::Chat => (
            TerminalKey::chat(cell_id),
            spawn_spec_for(kind, &cell, None, None)?,
        ),
        TerminalKind::Service => {
            let service_id = service_id
                .ok_or_else(|| ApiError::bad_request("service terminal requires a service id"))?;
            let service = state
                .supervisor
                .get_service(service_id)
                .await?
                .filter(|s| s.cell_id == cell_id)
                .ok_or_else(|| {
                    ApiError::not_found(format!("service not found: {}", service_id))
                })?;
            (
                TerminalKey::service(cell_id, service_id),
                spawn_spec_for(kind, &cell, Some(&service), None)?,
            )
        }
        TerminalKind::Setup => {
            let (_, template) = state
                .registry
                .resolve_template(&cell.workspace_id, &cell.template_id)?;
            (
                TerminalKey::setup(cell_id),
                spawn_spec_for(kind, &cell, None, Some(&template))?,
            )
        }
    };

    Ok((key, spec, cell))
}

/// Shared implementation of the four terminal stream endpoints.
async fn terminal_stream(
    state: AppState,
    cell_id: String,
    kind: TerminalKind,
    service_id: Option<String>,
    size: TerminalSizeQuery,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (key, spec, _) = resolve_terminal(&state, &cell_id, kind, service_id.as_deref()).await?;

    let (cols, rows) = size.dimensions();
    state.terminals.ensure_session(&key, spec, cols, rows).await?;
    let sub = state.terminals.subscribe(&key)?;

    let info = sub.info.clone();
    let snapshot = sub.snapshot;
    let mut events = sub.events;

    let stream = async_stream::stream! {
        yield Ok(ready_event(&info));
        yield Ok(Event::default()
            .event("snapshot")
            .data(serde_json::json!({ "content": snapshot, "seq": info.output_seq }).to_string()));

        // The process may have exited before this subscriber attached, in
        // which case the exit event already went out unheard.
        if info.status == TerminalStatus::Exited {
            yield Ok(Event::default()
                .event("exit")
                .data(serde_json::json!({ "exit_code": info.exit_code }).to_string()));
            return;
        }

        loop {
            match events.recv().await {
                Ok(TerminalEvent::Data { chunk, seq }) => {
                    yield Ok(Event::default()
                        .event("data")
                        .data(serde_json::json!({ "chunk": chunk, "seq": seq }).to_string()));
                }
                Ok(TerminalEvent::Exit { exit_code }) => {
                    yield Ok(Event::default()
                        .event("exit")
                        .data(serde_json::json!({ "exit_code": exit_code }).to_string()));
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    // A lagged viewer must resync from a fresh snapshot.
                    warn!(skipped, "terminal subscriber lagged, ending stream");
                    break;
                }
                Err(RecvError::Closed) => {
                    debug!("terminal event channel closed");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

fn ready_event(info: &TerminalSessionInfo) -> Event {
    Event::default().event("ready").data(
        serde_json::to_string(info)
            .unwrap_or_else(|_| "{}".to_string()),
    )
}

/// Stream the cell shell terminal.
#[instrument(skip(state))]
pub async fn cell_terminal_stream(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    terminal_stream(state, cell_id, TerminalKind::Cell, None, size).await
}

/// Stream the agent-chat terminal.
#[instrument(skip(state))]
pub async fn chat_terminal_stream(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    terminal_stream(state, cell_id, TerminalKind::Chat, None, size).await
}

/// Stream the setup terminal.
#[instrument(skip(state))]
pub async fn setup_terminal_stream(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    terminal_stream(state, cell_id, TerminalKind::Setup, None, size).await
}

/// Stream a per-service terminal.
#[instrument(skip(state))]
pub async fn service_terminal_stream(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    terminal_stream(state, cell_id, TerminalKind::Service, Some(service_id), size).await
}

/// Shared implementation of terminal input endpoints.
async fn terminal_input(
    state: AppState,
    cell_id: String,
    kind: TerminalKind,
    service_id: Option<String>,
    request: TerminalInputRequest,
) -> ApiResult<StatusCode> {
    let (key, _, _) = resolve_terminal(&state, &cell_id, kind, service_id.as_deref()).await?;
    state.terminals.write_input(&key, request.data.as_bytes())?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shared implementation of terminal resize endpoints.
async fn terminal_resize(
    state: AppState,
    cell_id: String,
    kind: TerminalKind,
    service_id: Option<String>,
    request: TerminalResizeRequest,
) -> ApiResult<StatusCode> {
    let (key, _, _) = resolve_terminal(&state, &cell_id, kind, service_id.as_deref()).await?;
    state.terminals.resize(&key, request.cols, request.rows)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Shared implementation of terminal restart endpoints: new process, fresh
/// buffer, same key.
async fn terminal_restart(
    state: AppState,
    cell_id: String,
    kind: TerminalKind,
    service_id: Option<String>,
    size: TerminalSizeQuery,
) -> ApiResult<Json<TerminalSessionInfo>> {
    let (key, spec, _) = resolve_terminal(&state, &cell_id, kind, service_id.as_deref()).await?;
    let (cols, rows) = size.dimensions();
    let info = state.terminals.restart(&key, spec, cols, rows).await?;
    Ok(Json(info))
}

/// Send input to the cell shell terminal.
#[instrument(skip(state, request))]
pub async fn cell_terminal_input(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalInputRequest>,
) -> ApiResult<StatusCode> {
    terminal_input(state, cell_id, TerminalKind::Cell, None, request).await
}

/// Resize the cell shell terminal.
#[instrument(skip(state))]
pub async fn cell_terminal_resize(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalResizeRequest>,
) -> ApiResult<StatusCode> {
    terminal_resize(state, cell_id, TerminalKind::Cell, None, request).await
}

/// Restart the cell shell terminal.
#[instrument(skip(state))]
pub async fn cell_terminal_restart(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Json<TerminalSessionInfo>> {
    terminal_restart(state, cell_id, TerminalKind::Cell, None, size).await
}

/// Send input to the agent-chat terminal.
#[instrument(skip(state, request))]
pub async fn chat_terminal_input(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalInputRequest>,
) -> ApiResult<StatusCode> {
    terminal_input(state, cell_id, TerminalKind::Chat, None, request).await
}

/// Resize the agent-chat terminal.
#[instrument(skip(state))]
pub async fn chat_terminal_resize(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalResizeRequest>,
) -> ApiResult<StatusCode> {
    terminal_resize(state, cell_id, TerminalKind::Chat, None, request).await
}

/// Restart the agent-chat terminal.
#[instrument(skip(state))]
pub async fn chat_terminal_restart(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Json<TerminalSessionInfo>> {
    terminal_restart(state, cell_id, TerminalKind::Chat, None, size).await
}

/// Send input to the setup terminal.
#[instrument(skip(state, request))]
pub async fn setup_terminal_input(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalInputRequest>,
) -> ApiResult<StatusCode> {
    terminal_input(state, cell_id, TerminalKind::Setup, None, request).await
}

/// Resize the setup terminal.
#[instrument(skip(state))]
pub async fn setup_terminal_resize(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Json(request): Json<TerminalResizeRequest>,
) -> ApiResult<StatusCode> {
    terminal_resize(state, cell_id, TerminalKind::Setup, None, request).await
}

/// Restart the setup terminal.
#[instrument(skip(state))]
pub async fn setup_terminal_restart(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Json<TerminalSessionInfo>> {
    terminal_restart(state, cell_id, TerminalKind::Setup, None, size).await
}

/// Send input to a per-service terminal.
#[instrument(skip(state, request))]
pub async fn service_terminal_input(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
    Json(request): Json<TerminalInputRequest>,
) -> ApiResult<StatusCode> {
    terminal_input(state, cell_id, TerminalKind::Service, Some(service_id), request).await
}

/// Resize a per-service terminal.
#[instrument(skip(state))]
pub async fn service_terminal_resize(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
    Json(request): Json<TerminalResizeRequest>,
) -> ApiResult<StatusCode> {
    terminal_resize(state, cell_id, TerminalKind::Service, Some(service_id), request).await
}

/// Restart a per-service terminal.
#[instrument(skip(state))]
pub async fn service_terminal_restart(
    State(state): State<AppState>,
    Path((cell_id, service_id)): Path<(String, String)>,
    Query(size): Query<TerminalSizeQuery>,
) -> ApiResult<Json<TerminalSessionInfo>> {
    terminal_restart(state, cell_id, TerminalKind::Service, Some(service_id), size).await
}

/// Cell-list-level live updates for a workspace: an initial `cells` snapshot
/// event, then an `update` event per cell status change.
#[instrument(skip(state))]
pub async fn workspace_cell_stream(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.registry.get(&workspace_id)?;

    let cells = state.cells.list_for_workspace(&workspace_id).await?;
    let mut updates = state.orchestrator.subscribe_updates();

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("cells")
            .data(serde_json::to_string(&cells).unwrap_or_else(|_| "[]".to_string())));

        loop {
            match updates.recv().await {
                Ok(update) if update.workspace_id == workspace_id => {
                    yield Ok(Event::default()
                        .event("update")
                        .data(serde_json::to_string(&update).unwrap_or_else(|_| "{}".to_string())));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "workspace stream subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
