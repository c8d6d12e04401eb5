//! API integration tests.
//!
//! These tests drive the HTTP router directly and check status codes and
//! response bodies.

use crony::Engine;
use crony::api::{build_router, create_api_state};
use crony::config::EngineConfig;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

/// Create a router over an in-memory engine with the scheduler running.
async fn create_test_router() -> (Router, Arc<Engine>) {
    let engine = Arc::new(Engine::open(EngineConfig::ephemeral()).await.unwrap());
    (build_router(create_api_state(engine.clone())), engine)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Test: Health endpoint responds with status ok.
#[tokio::test]
async fn test_health_endpoint() {
    let (router, engine) = create_test_router().await;

    let (status, json) = send(&router, Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    engine.shutdown().await;
}

/// Test: Scheduler state, pause and resume endpoints.
#[tokio::test]
async fn test_scheduler_endpoints() {
    let (router, engine) = create_test_router().await;

    let (status, json) = send(&router, Method::GET, "/api/scheduler/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["is_running"], true);
    assert_eq!(json["is_paused"], false);

    let (status, _) = send(&router, Method::POST, "/api/scheduler/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send(&router, Method::GET, "/api/scheduler/state", None).await;
    assert_eq!(json["state"], "paused");

    let (status, json) = send(&router, Method::POST, "/api/scheduler/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "scheduler resumed");

    engine.shutdown().await;
}

/// Test: Create, read, update and delete a task.
#[tokio::test]
async fn test_task_crud() {
    let (router, engine) = create_test_router().await;

    let (status, json) = send(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({"name": "Backup", "command": "echo backup", "schedule": "0 3 * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["task"]["name"], "Backup");
    assert_eq!(json["task"]["enabled"], true);
    assert!(json["schedule_error"].is_null());
    let id = json["task"]["id"].as_str().unwrap().to_string();

    let (status, json) = send(&router, Method::GET, &format!("/api/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id.as_str());
    assert_eq!(json["schedule"], "0 3 * * *");
    assert_eq!(json["running"], false);
    assert!(json["next_trigger"].is_string());

    let (status, json) = send(
        &router,
        Method::PUT,
        &format!("/api/tasks/{id}"),
        Some(json!({"name": "Backup", "command": "echo backup", "schedule": "99 * * * *"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["schedule_error"].as_str().unwrap().contains("invalid"));

    let (status, json) = send(&router, Method::GET, "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert!(json["tasks"][0]["next_trigger"].is_null());

    let (status, _) = send(&router, Method::DELETE, &format!("/api/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&router, Method::GET, &format!("/api/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    engine.shutdown().await;
}

/// Test: Listing reports the next trigger of every scheduled task.
#[tokio::test]
async fn test_list_reports_next_trigger_per_task() {
    let (router, engine) = create_test_router().await;

    for (name, schedule) in [("a", Some("@hourly")), ("b", None), ("c", Some("15 4 * * *"))] {
        let mut body = json!({"name": name, "command": "true"});
        if let Some(schedule) = schedule {
            body["schedule"] = json!(schedule);
        }
        let (status, _) = send(&router, Method::POST, "/api/tasks", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, json) = send(&router, Method::GET, "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);
    let tasks = json["tasks"].as_array().unwrap();
    for task in tasks {
        let scheduled = !task["schedule"].is_null();
        assert_eq!(task["next_trigger"].is_string(), scheduled, "{task}");
        assert_eq!(task["running"], false);
    }

    engine.shutdown().await;
}

/// Test: Blank fields are rejected with 400.
#[tokio::test]
async fn test_validation_error_is_bad_request() {
    let (router, engine) = create_test_router().await;

    let (status, json) = send(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({"name": "   ", "command": "echo"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
    assert!(json["error"].as_str().unwrap().contains("name"));
    engine.shutdown().await;
}

/// Test: Unknown ids return 404 on every task route.
#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let (router, engine) = create_test_router().await;

    for (method, uri) in [
        (Method::GET, "/api/tasks/nope"),
        (Method::DELETE, "/api/tasks/nope"),
        (Method::POST, "/api/tasks/nope/run"),
        (Method::POST, "/api/tasks/nope/stop"),
        (Method::GET, "/api/tasks/nope/output"),
    ] {
        let (status, json) = send(&router, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(json["code"], "NOT_FOUND");
    }

    engine.shutdown().await;
}

/// Test: Run, conflict on double run, live output, stop.
#[cfg(unix)]
#[tokio::test]
async fn test_run_and_stop_endpoints() {
    let (router, engine) = create_test_router().await;

    let (_, json) = send(
        &router,
        Method::POST,
        "/api/tasks",
        Some(json!({"name": "Slow", "command": "echo started; sleep 30"})),
    )
    .await;
    let id = json["task"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&router, Method::POST, &format!("/api/tasks/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, json) = send(&router, Method::POST, &format!("/api/tasks/{id}/run"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(json["run_id"].is_string());

    let (status, json) = send(&router, Method::POST, &format!("/api/tasks/{id}/run"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "CONFLICT");

    let start = tokio::time::Instant::now();
    loop {
        let (status, json) =
            send(&router, Method::GET, &format!("/api/tasks/{id}/output"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["running"], true);
        if json["output"] == "started\n" {
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "no output seen");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, json) = send(&router, Method::GET, "/api/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 1);
    assert_eq!(json["runs"][0]["reason"], "manual");

    let (status, _) = send(&router, Method::POST, &format!("/api/tasks/{id}/stop"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let start = tokio::time::Instant::now();
    loop {
        let (_, json) = send(&router, Method::GET, &format!("/api/tasks/{id}"), None).await;
        if json["last_result"]["status"] == "cancelled" && json["running"] == false {
            assert_eq!(json["last_result"]["output"], "started\n");
            break;
        }
        assert!(start.elapsed() < Duration::from_secs(10), "run never cancelled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    engine.shutdown().await;
}

/// Test: The events endpoint is a Server-Sent Events stream.
#[tokio::test]
async fn test_events_endpoint_is_sse() {
    let (router, engine) = create_test_router().await;

    let request = Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(engine.events().receiver_count(), 1);

    drop(response);
    engine.shutdown().await;
}

/// Test: Emitted events are delivered as named SSE frames.
#[cfg(unix)]
#[tokio::test]
async fn test_events_stream_carries_run_events() {
    let (router, engine) = create_test_router().await;
    let saved = engine
        .create_task(crony::TaskDraft::new("hello", "echo hello"))
        .await
        .unwrap();

    let request = Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let mut body = response.into_body();

    engine.run_task(&saved.task.id).await.unwrap();

    let mut received = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !received.contains("\"status\":\"success\"") {
        let frame = tokio::time::timeout_at(deadline, body.frame())
            .await
            .expect("timed out waiting for events")
            .unwrap()
            .unwrap();
        if let Ok(data) = frame.into_data() {
            received.push_str(std::str::from_utf8(&data).unwrap());
        }
    }

    assert!(received.contains("event: task-state-changed"));
    assert!(received.contains("event: task-output-chunk"));
    assert!(received.contains("\"text\":\"hello\\n\""));

    drop(body);
    engine.shutdown().await;
}
