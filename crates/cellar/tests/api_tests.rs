//! API integration tests.

use axum::http::{Method, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};

use cellar::cell::{Cell, CellPhase, CellProvisioningState, CellStatus};

mod common;
use common::test_app;

/// Health endpoint works without any setup.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app().await;

    let (status, body) = app.request(Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

/// Creating a cell returns 201 immediately with status `spawning`, then the
/// detached workflow drives it to `ready` with both services running.
#[tokio::test]
async fn test_create_cell_provisions_two_services() {
    let app = test_app().await;

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();

    let ready = app.wait_for_cell_status(&cell_id, "ready").await;
    assert!(ready["workspace_path"].is_string());
    assert!(ready["branch_name"].is_string());
    assert_eq!(ready["last_setup_error"], Value::Null);

    let (status, services) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/services", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let services = services.as_array().unwrap();
    assert_eq!(services.len(), 2);
    for service in services {
        assert_eq!(service["status"], "running", "service: {service}");
        assert!(service["pid"].as_i64().unwrap() > 0);
    }
}

/// Stopping all services drives both to non-running and logs one bulk
/// `services.stop` plus two per-service `service.stop` events.
#[tokio::test]
async fn test_stop_all_services_and_activity_granularity() {
    let app = test_app().await;

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, services) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/services/stop", cell_id),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    for service in services.as_array().unwrap() {
        assert_eq!(service["status"], "stopped");
        assert_eq!(service["pid"], Value::Null);
    }

    let (_, events) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/activity", cell_id),
            None,
        )
        .await;
    let events = events.as_array().unwrap();
    let count = |t: &str| events.iter().filter(|e| e["event_type"] == t).count();
    assert_eq!(count("services.stop"), 1);
    assert_eq!(count("service.stop"), 2);
}

/// Stop-all then start-all returns every previously-running service to
/// running, with both event granularities observable.
#[tokio::test]
async fn test_stop_start_round_trip() {
    let app = test_app().await;

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    app.request(
        Method::POST,
        &format!("/api/cells/{}/services/stop", cell_id),
        Some(json!({})),
    )
    .await;

    let (status, services) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/services/start", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    for service in services.as_array().unwrap() {
        let s = service["status"].as_str().unwrap();
        assert!(s == "running" || s == "starting", "unexpected status {s}");
    }

    let (_, events) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/activity", cell_id),
            None,
        )
        .await;
    let events = events.as_array().unwrap();
    let count = |t: &str| events.iter().filter(|e| e["event_type"] == t).count();
    assert_eq!(count("services.stop"), 1);
    assert_eq!(count("services.start"), 1);
    assert_eq!(count("service.stop"), 2);
    assert_eq!(count("service.start"), 2);
}

/// A template whose setup command exits 42 deterministically yields
/// `status == "error"` with the exit code and template ID preserved.
#[tokio::test]
async fn test_failing_setup_records_exit_code_and_template() {
    let app = test_app().await;

    let cell = app.create_cell("failing-setup", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();

    let errored = app.wait_for_cell_status(&cell_id, "error").await;
    let message = errored["last_setup_error"].as_str().unwrap();
    assert!(message.contains("exit code 42"), "message: {message}");
    assert!(message.contains("failing-setup"), "message: {message}");
}

/// `setup/retry` appends exactly one `setup.retry` event per call,
/// regardless of outcome.
#[tokio::test]
async fn test_retry_setup_appends_one_event_per_call() {
    let app = test_app().await;

    let cell = app.create_cell("failing-setup", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "error").await;

    for expected in 1..=2 {
        let (status, body) = app
            .request(
                Method::POST,
                &format!("/api/cells/{}/setup/retry", cell_id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        // The setup command still exits 42, so the cell stays errored.
        assert_eq!(body["status"], "error");

        let (_, events) = app
            .request(
                Method::GET,
                &format!("/api/cells/{}/activity", cell_id),
                None,
            )
            .await;
        let retries = events
            .as_array()
            .unwrap()
            .iter()
            .filter(|e| e["event_type"] == "setup.retry")
            .count();
        assert_eq!(retries, expected);
    }
}

/// Retrying setup on a cell that is not errored is rejected.
#[tokio::test]
async fn test_retry_setup_requires_error_state() {
    let app = test_app().await;

    let cell = app.create_cell("empty", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/setup/retry", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("error state"));
}

/// Deleting a cell that is not archived is rejected with a message
/// containing "archived".
#[tokio::test]
async fn test_delete_requires_archive_first() {
    let app = test_app().await;

    let cell = app.create_cell("empty", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, body) = app
        .request(Method::DELETE, &format!("/api/cells/{}", cell_id), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("archived"));
    assert_eq!(app.worktrees.removal_count(), 0);
}

/// Restoring a cell that is not archived is rejected with "not archived".
#[tokio::test]
async fn test_restore_requires_archived() {
    let app = test_app().await;

    let cell = app.create_cell("empty", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/restore", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("not archived"));
}

/// Archive stops every service without removing the worktree; starting a
/// service on the archived cell is rejected before any process action;
/// delete then removes the worktree exactly once.
#[tokio::test]
async fn test_archive_then_delete_lifecycle() {
    let app = test_app().await;

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    let ready = app.wait_for_cell_status(&cell_id, "ready").await;
    let worktree = ready["workspace_path"].as_str().unwrap().to_string();

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/archive", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "archived");

    // Worktree retained, services stopped with ports released.
    assert!(std::path::Path::new(&worktree).exists());
    let (_, services) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/services", cell_id),
            None,
        )
        .await;
    let services = services.as_array().unwrap();
    let service_id = services[0]["id"].as_str().unwrap().to_string();
    for service in services {
        assert_eq!(service["status"], "stopped");
        assert_eq!(service["port"], Value::Null);
    }

    // Start on an archived cell's service: rejected, status unchanged.
    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/services/{}/start", cell_id, service_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("archived"));
    let (_, service) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/services", cell_id),
            None,
        )
        .await;
    assert_eq!(service.as_array().unwrap()[0]["status"], "stopped");

    // Delete the archived cell: worktree removed exactly once.
    let (status, _) = app
        .request(Method::DELETE, &format!("/api/cells/{}", cell_id), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(app.worktrees.removal_count(), 1);

    let (status, _) = app
        .request(Method::GET, &format!("/api/cells/{}", cell_id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Archive then restore brings the cell back to ready with services
/// restarted and a fresh agent session.
#[tokio::test]
async fn test_archive_restore_round_trip() {
    let app = test_app().await;

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    app.request(
        Method::POST,
        &format!("/api/cells/{}/archive", cell_id),
        None,
    )
    .await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/restore", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "restore failed: {body}");
    assert_eq!(body["status"], "ready");

    let (_, services) = app
        .request(
            Method::GET,
            &format!("/api/cells/{}/services", cell_id),
            None,
        )
        .await;
    for service in services.as_array().unwrap() {
        let s = service["status"].as_str().unwrap();
        assert!(s == "running" || s == "starting", "unexpected status {s}");
    }
}

/// Resuming a stranded `spawning` cell whose template was deleted in the
/// interim yields `status == "error"` with "no longer exists", and the
/// attempt counter reflects the resume.
#[tokio::test]
async fn test_resume_with_deleted_template() {
    let app = test_app().await;

    let cell = Cell {
        id: "stranded-1".to_string(),
        name: "stranded".to_string(),
        description: String::new(),
        template_id: "ghost".to_string(),
        workspace_id: "ws-1".to_string(),
        workspace_path: None,
        workspace_root_path: app
            .workspace_dir
            .path()
            .display()
            .to_string(),
        branch_name: None,
        base_commit: None,
        status: CellStatus::Spawning,
        phase: CellPhase::Planning,
        last_setup_error: None,
        created_at: Utc::now().to_rfc3339(),
    };
    let state = CellProvisioningState {
        cell_id: cell.id.clone(),
        model_id_override: None,
        provider_id_override: None,
        attempt_count: 1,
        started_at: Utc::now().to_rfc3339(),
        finished_at: None,
    };
    app.state.cells.create(&cell, &state).await.unwrap();

    let resumed = app.state.orchestrator.resume_spawning_cells().await.unwrap();
    assert_eq!(resumed, 1);

    let errored = app.wait_for_cell_status("stranded-1", "error").await;
    let message = errored["last_setup_error"].as_str().unwrap();
    assert!(message.contains("no longer exists"), "message: {message}");
    assert!(message.contains("ghost"), "message: {message}");

    assert_eq!(errored["provisioning"]["attempt_count"], 2);
    assert!(errored["provisioning"]["finished_at"].is_string());
}

/// Terminal operations on an archived cell are rejected.
#[tokio::test]
async fn test_terminal_rejected_on_archived_cell() {
    let app = test_app().await;

    let cell = app.create_cell("empty", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;
    app.request(
        Method::POST,
        &format!("/api/cells/{}/archive", cell_id),
        None,
    )
    .await;

    let (status, body) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/terminal/input", cell_id),
            Some(json!({ "data": "ls\n" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("archived"));
}

/// Terminal input without a live session is an error, not a silent no-op.
#[tokio::test]
async fn test_terminal_input_without_session_fails() {
    let app = test_app().await;

    let cell = app.create_cell("empty", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/terminal/input", cell_id),
            Some(json!({ "data": "ls\n" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Unknown cells and cross-cell service references return 404.
#[tokio::test]
async fn test_not_found_paths() {
    let app = test_app().await;

    let (status, _) = app
        .request(Method::GET, "/api/cells/does-not-exist", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let cell = app.create_cell("two-service", None).await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, _) = app
        .request(
            Method::POST,
            &format!("/api/cells/{}/services/not-a-service/start", cell_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// The cell list supports workspace filtering and the create description is
/// delivered to the agent transcript.
#[tokio::test]
async fn test_list_cells_and_initial_prompt() {
    let app = test_app().await;

    let cell = app
        .create_cell("empty", Some("Build the widget feature"))
        .await;
    let cell_id = cell["id"].as_str().unwrap().to_string();
    let ready = app.wait_for_cell_status(&cell_id, "ready").await;

    let (status, cells) = app
        .request(Method::GET, "/api/cells?workspace_id=ws-1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cells.as_array().unwrap().len(), 1);

    // The initial prompt landed in the worktree transcript.
    let worktree = ready["workspace_path"].as_str().unwrap();
    let transcript =
        std::fs::read_to_string(format!("{}/.cellar/agent-transcript.log", worktree)).unwrap();
    assert!(transcript.contains("Build the widget feature"));
}
