//! Integration tests for the administrative HTTP API

mod helpers;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use helpers::*;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;
use umr_pipeline::AppState;

/// Test helper: app over a single water meter
fn create_test_app(providers: &[Arc<ScriptedProvider>]) -> (axum::Router, TestPipeline) {
    let (pipeline, _sink) = TestPipeline::water(providers);
    let state = AppState::new(Arc::clone(&pipeline.orchestrator));
    (umr_pipeline::build_router(state), pipeline)
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _pipeline) = create_test_app(&[]);

    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "umr-pipeline");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(json["meters"], 1);
    assert!(json.get("last_error").is_none());
}

#[tokio::test]
async fn test_run_endpoint_returns_report() {
    let provider = ScriptedProvider::responding("primary", reading_json(2271, 8, 0.017, "medium"));
    let (app, _pipeline) = create_test_app(&[provider]);

    let (status, json) = send(&app, "POST", "/meters/water_main/run", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["meter_name"], "water_main");
    assert_eq!(json["state"]["state"], "complete");
    assert_eq!(json["reading"]["digital_reading"], 2271);
    assert_eq!(json["reading"]["confidence"], "medium");
    assert!(json["archive_id"].as_str().unwrap().starts_with("water_main_"));

    let (status, json) = send(&app, "GET", "/meters/water_main/archive?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["entries"].as_array().unwrap().len(), 1);
    assert_eq!(
        json["entries"][0]["metadata"]["snapshot"]["rotation_degrees"],
        0
    );
}

#[tokio::test]
async fn test_failed_run_reports_bad_gateway_and_degrades_health() {
    let (app, _pipeline) = create_test_app(&[ScriptedProvider::failing("primary")]);

    let (status, json) = send(&app, "POST", "/meters/water_main/run", None).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["error"]["code"], "NO_PROVIDER_SUCCEEDED");

    let (_, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(health["status"], "degraded");
    assert!(health["last_error"].as_str().unwrap().starts_with("water_main:"));

    let (_, stats) = send(&app, "GET", "/stats", None).await;
    assert_eq!(stats["water_main"]["failed_runs"], 1);
}

#[tokio::test]
async fn test_unknown_meter_is_404() {
    let (app, _pipeline) = create_test_app(&[]);

    for (method, uri) in [
        ("POST", "/meters/attic/run"),
        ("GET", "/meters/attic/archive"),
        ("GET", "/meters/attic/rotation"),
    ] {
        let (status, json) = send(&app, method, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }
}

#[tokio::test]
async fn test_rotation_round_trip() {
    let (app, _pipeline) = create_test_app(&[]);

    let (status, json) = send(&app, "GET", "/meters/water_main/rotation", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rotation"], 0);

    let (status, json) = send(
        &app,
        "PUT",
        "/meters/water_main/rotation",
        Some(json!({ "rotation": 180 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rotation"], 180);

    let (status, json) = send(
        &app,
        "PUT",
        "/meters/water_main/rotation",
        Some(json!({ "rotation": 45 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "BAD_REQUEST");

    let (_, json) = send(&app, "GET", "/meters/water_main/rotation", None).await;
    assert_eq!(json["rotation"], 180);
}

#[tokio::test]
async fn test_reanalyze_and_delete_endpoints() {
    let provider = ScriptedProvider::new(
        "primary",
        vec![
            Script::Respond(reading_json(50, 0, 0.5, "low")),
            Script::Respond(reading_json(58, 0, 0.5, "high")),
        ],
    );
    let (app, _pipeline) = create_test_app(&[provider]);
    let (_, report) = send(&app, "POST", "/meters/water_main/run", None).await;
    let id = report["archive_id"].as_str().unwrap().to_string();

    let (status, json) = send(
        &app,
        "POST",
        &format!("/meters/water_main/archive/{}/reanalyze", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["metadata"]["meter_reading"]["digital_reading"], 58);
    assert!(json["metadata"]["reanalyzed_at"].is_string());

    let uri = format!("/meters/water_main/archive/{}", id);
    let (status, json) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deleted"], true);

    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
