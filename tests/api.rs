//! Control-plane surface tests driven through the router, without
//! binding a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tower::ServiceExt;

use homeworq::api::router;
use homeworq::{Engine, Settings, TaskRegistry};

fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register("echo", "Echo", Some("Returns its parameters"), |params| {
            async move { Ok(serde_json::Value::Object(params)) }
        })
        .unwrap();
    registry
}

async fn test_engine(api_auth: bool) -> Arc<Engine> {
    let settings = Settings {
        api_on: false, // the router is driven directly
        api_auth,
        db_uri: "sqlite://:memory:".to_string(),
        ..Default::default()
    };
    let engine = Arc::new(Engine::new(settings, test_registry(), vec![]).unwrap());
    engine.start().await.unwrap();
    engine
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_and_task_catalog() {
    let engine = test_engine(false).await;
    let app = router(engine.clone());

    let response = app.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    let response = app.clone().oneshot(get("/api/tasks")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tasks = body_json(response).await;
    assert_eq!(tasks[0]["name"], "echo");
    assert_eq!(tasks[0]["title"], "Echo");

    let response = app.clone().oneshot(get("/api/tasks/echo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(get("/api/tasks/nope")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    engine.stop().await;
}

#[tokio::test]
async fn job_crud_roundtrip() {
    let engine = test_engine(false).await;
    let app = router(engine.clone());

    // Create.
    let spec = serde_json::json!({
        "task": "echo",
        "params": {"key": "value"},
        "schedule": {"interval": 1, "unit": "hours"},
        "options": {"timeout": 30}
    });
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/jobs", spec))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let job = body_json(response).await;
    let id = job["id"].as_str().unwrap().to_string();
    assert_eq!(job["task"]["name"], "echo");
    assert_eq!(job["schedule"]["interval"], 1);

    // Read (list and by id).
    let response = app.clone().oneshot(get("/api/jobs?task=echo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/jobs/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Update: switch to a cron shape.
    let patch = serde_json::json!({"schedule": "0 2 * * *"});
    let response = app
        .clone()
        .oneshot(json_request("PUT", &format!("/api/jobs/{id}"), patch))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["schedule"], "0 2 * * *");

    // Invalid update is a 400 with a stable code.
    let patch = serde_json::json!({"schedule": "not a cron"});
    let response = app
        .clone()
        .oneshot(json_request("PUT", &format!("/api/jobs/{id}"), patch))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_CRON");

    // Delete, then 404.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/jobs/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/jobs/{id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    engine.stop().await;
}

#[tokio::test]
async fn create_job_with_unknown_task_is_rejected() {
    let engine = test_engine(false).await;
    let app = router(engine.clone());

    let spec = serde_json::json!({
        "task": "ghost",
        "schedule": {"interval": 1, "unit": "hours"}
    });
    let response = app
        .oneshot(json_request("POST", "/api/jobs", spec))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_JOB");

    engine.stop().await;
}

#[tokio::test]
async fn ad_hoc_run_records_unattached_log() {
    let engine = test_engine(false).await;
    let app = router(engine.clone());

    let body = serde_json::json!({"hello": "world"});
    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/tasks/echo/run", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let log = body_json(response).await;
    assert_eq!(log["job_id"], serde_json::Value::Null);
    assert_eq!(log["status"], "completed");
    assert_eq!(log["result"]["hello"], "world");

    // The log is visible through the paginated listing.
    let response = app.clone().oneshot(get("/api/logs")).await.unwrap();
    let page = body_json(response).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["offset"], 0);
    assert!(page["items"].as_array().unwrap().len() == 1);

    // And filters by status.
    let response = app
        .clone()
        .oneshot(get("/api/logs?status=failed"))
        .await
        .unwrap();
    let page = body_json(response).await;
    assert_eq!(page["total"], 0);

    engine.stop().await;
}

#[tokio::test]
async fn analytics_endpoints_respond() {
    let engine = test_engine(false).await;
    let app = router(engine.clone());

    // Seed one ad-hoc execution.
    let body = serde_json::json!({});
    app.clone()
        .oneshot(json_request("POST", "/api/tasks/echo/run", body))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(get("/api/analytics/recent-activity"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(get("/api/analytics/execution-history"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/analytics/upcoming-executions"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/analytics/task-distribution"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/analytics/error-rate"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let rate = body_json(response).await;
    assert_eq!(rate["total"], 1);
    assert_eq!(rate["failed"], 0);
    assert_eq!(rate["error_rate"], 0.0);

    engine.stop().await;
}

#[tokio::test]
async fn basic_auth_guards_every_route() {
    let engine = test_engine(true).await;
    let app = router(engine.clone());

    let response = app.clone().oneshot(get("/api/tasks")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    use base64::Engine as _;
    let credentials = base64::engine::general_purpose::STANDARD.encode("admin:admin");
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tasks")
                .header(header::AUTHORIZATION, format!("Basic {credentials}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    engine.stop().await;
}
