//! HTTP API tests against the in-memory application state.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use webhook_delivery_service::config::Settings;
use webhook_delivery_service::server::{create_app, AppState};

const API_KEY: &str = "test-admin-key";

fn app() -> Router {
    let mut settings = Settings::default();
    settings.api.key = Some(API_KEY.to_string());
    create_app(AppState::in_memory(settings))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("X-API-Key", API_KEY);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create_endpoint(app: &Router, events: Value) -> Value {
    let (status, body) = send(
        app,
        "POST",
        "/api/v1/webhooks",
        Some(json!({"url": "https://example.com/hook", "events": events})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn test_api_key_required() {
    let app = app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/webhooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/webhooks")
                .header("X-API-Key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "GET", "/api/v1/webhooks", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_is_public() {
    let app = app();
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_endpoint_lifecycle() {
    let app = app();

    let created = create_endpoint(&app, json!(["order.created", "order.updated"])).await;
    let id = created["id"].as_str().unwrap().to_string();
    let secret = created["secret"].as_str().unwrap().to_string();
    assert!(!secret.is_empty());
    assert_eq!(created["is_active"], true);

    // Secret is only revealed on create and rotate
    let (status, fetched) = send(&app, "GET", &format!("/api/v1/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(fetched.get("secret").is_none());

    let (status, updated) = send(
        &app,
        "PATCH",
        &format!("/api/v1/webhooks/{id}"),
        Some(json!({"events": ["payment.failed"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["events"], json!(["payment.failed"]));

    let (status, rotated) = send(
        &app,
        "POST",
        &format!("/api/v1/webhooks/{id}/rotate-secret"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["secret"].as_str().unwrap(), secret);

    let (status, list) = send(&app, "GET", "/api/v1/webhooks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);

    // No delivery history, so the endpoint is removed outright
    let (status, deleted) = send(&app, "DELETE", &format!("/api/v1/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deleted"], true);

    let (status, _) = send(&app, "GET", &format!("/api/v1/webhooks/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_endpoint_rejected() {
    let app = app();

    let (status, body) = send(
        &app,
        "POST",
        "/api/v1/webhooks",
        Some(json!({"url": "ftp://example.com", "events": ["order.created"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/webhooks",
        Some(json!({"url": "https://example.com", "events": ["made.up"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_trigger_event_fans_out() {
    let app = app();
    let endpoint = create_endpoint(&app, json!(["order.created"])).await;
    create_endpoint(&app, json!(["user.created"])).await;

    let (status, result) = send(
        &app,
        "POST",
        "/api/v1/events",
        Some(json!({"event_type": "order.created", "payload": {"order_id": 7}})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(result["endpoint_count"], 1);
    assert!(result["event_id"].as_str().unwrap().starts_with("evt_"));

    let delivery_id = result["delivery_ids"][0].as_str().unwrap().to_string();
    let (status, delivery) =
        send(&app, "GET", &format!("/api/v1/deliveries/{delivery_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(delivery["status"], "pending");
    assert_eq!(delivery["endpoint_id"], endpoint["id"]);

    let endpoint_id = endpoint["id"].as_str().unwrap();
    let (status, history) = send(
        &app,
        "GET",
        &format!("/api/v1/webhooks/{endpoint_id}/deliveries"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["count"], 1);

    // Endpoint with history is only deactivated
    let (status, deleted) = send(
        &app,
        "DELETE",
        &format!("/api/v1/webhooks/{endpoint_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deactivated"], true);
    assert_eq!(deleted["deleted"], false);
}

#[tokio::test]
async fn test_trigger_unknown_event_rejected() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/events",
        Some(json!({"event_type": "made.up", "payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_recovery_errors_map_to_status() {
    let app = app();
    let missing = uuid::Uuid::new_v4();

    let path = format!("/api/v1/deliveries/{missing}/retry");
    let (status, _) = send(&app, "POST", &path, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/v1/dead-letters/{missing}/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, list) = send(&app, "GET", "/api/v1/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 0);
}

#[tokio::test]
async fn test_event_types_listed() {
    let app = app();
    let (status, types) = send(&app, "GET", "/api/v1/webhook-event-types", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(types
        .as_array()
        .unwrap()
        .iter()
        .any(|t| t["name"] == "order.created"));
}
