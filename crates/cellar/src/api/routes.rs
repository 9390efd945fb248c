//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use super::stream;

/// Create the application router.
///
/// The workspace stream route keeps its `/cells/workspace/...` prefix ahead
/// of the generic `/cells/{cell_id}` routes; specific patterns must never be
/// shadowed by the `{cell_id}` capture.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        // Workspace-level stream; registered before the {cell_id} captures.
        .route(
            "/cells/workspace/{workspace_id}/stream",
            get(stream::workspace_cell_stream),
        )
        // Cell lifecycle
        .route(
            "/cells",
            get(handlers::list_cells).post(handlers::create_cell),
        )
        .route(
            "/cells/{cell_id}",
            get(handlers::get_cell).delete(handlers::delete_cell),
        )
        .route("/cells/{cell_id}/archive", post(handlers::archive_cell))
        .route("/cells/{cell_id}/restore", post(handlers::restore_cell))
        .route("/cells/{cell_id}/setup/retry", post(handlers::retry_setup))
        // Activity feed
        .route("/cells/{cell_id}/activity", get(handlers::cell_activity))
        // Services: bulk control before the {service_id} captures.
        .route("/cells/{cell_id}/services", get(handlers::list_services))
        .route(
            "/cells/{cell_id}/services/start",
            post(handlers::start_services),
        )
        .route(
            "/cells/{cell_id}/services/stop",
            post(handlers::stop_services),
        )
        .route(
            "/cells/{cell_id}/services/restart",
            post(handlers::restart_services),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/start",
            post(handlers::start_service),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/stop",
            post(handlers::stop_service),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/restart",
            post(handlers::restart_service),
        )
        // Cell shell terminal
        .route(
            "/cells/{cell_id}/terminal/stream",
            get(stream::cell_terminal_stream),
        )
        .route(
            "/cells/{cell_id}/terminal/input",
            post(stream::cell_terminal_input),
        )
        .route(
            "/cells/{cell_id}/terminal/resize",
            post(stream::cell_terminal_resize),
        )
        .route(
            "/cells/{cell_id}/terminal/restart",
            post(stream::cell_terminal_restart),
        )
        // Agent-chat terminal
        .route(
            "/cells/{cell_id}/chat/terminal/stream",
            get(stream::chat_terminal_stream),
        )
        .route(
            "/cells/{cell_id}/chat/terminal/input",
            post(stream::chat_terminal_input),
        )
        .route(
            "/cells/{cell_id}/chat/terminal/resize",
            post(stream::chat_terminal_resize),
        )
        .route(
            "/cells/{cell_id}/chat/terminal/restart",
            post(stream::chat_terminal_restart),
        )
        // Setup terminal
        .route(
            "/cells/{cell_id}/setup/terminal/stream",
            get(stream::setup_terminal_stream),
        )
        .route(
            "/cells/{cell_id}/setup/terminal/input",
            post(stream::setup_terminal_input),
        )
        .route(
            "/cells/{cell_id}/setup/terminal/resize",
            post(stream::setup_terminal_resize),
        )
        .route(
            "/cells/{cell_id}/setup/terminal/restart",
            post(stream::setup_terminal_restart),
        )
        // Per-service terminals
        .route(
            "/cells/{cell_id}/services/{service_id}/terminal/stream",
            get(stream::service_terminal_stream),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/terminal/input",
            post(stream::service_terminal_input),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/terminal/resize",
            post(stream::service_terminal_resize),
        )
        .route(
            "/cells/{cell_id}/services/{service_id}/terminal/restart",
            post(stream::service_terminal_restart),
        )
        .with_state(state.clone());

    Router::new()
        .route("/health", get(handlers::health))
        .with_state(state)
        .nest("/api", api_routes)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer from configured origins; with none configured, only
/// local development origins are allowed.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let headers = [header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN];

    let origins: Vec<HeaderValue> = state
        .allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin([
                "http://localhost:3000".parse::<HeaderValue>().unwrap(),
                "http://127.0.0.1:3000".parse::<HeaderValue>().unwrap(),
            ])
            .allow_methods(methods)
            .allow_headers(headers)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
    }
}
