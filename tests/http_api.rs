//! HTTP surface tests, driven in-process with `oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tower::ServiceExt;

use coach_core::affinity::SessionAffinity;
use coach_core::config::CoreConfig;
use coach_core::dispatch::Dispatcher;
use coach_core::error::LlmError;
use coach_core::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use coach_core::routes::api_routes;
use coach_core::store::{Database, LibSqlBackend};

struct Offline;

#[async_trait]
impl LlmProvider for Offline {
    fn model_name(&self) -> &str {
        "offline"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "offline".into(),
            reason: "no network in tests".into(),
        })
    }
}

async fn app() -> Router {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::new(Offline),
        Arc::new(SessionAffinity::new()),
        &CoreConfig::default(),
    ));
    api_routes(dispatcher, db)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app().await;
    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn register_then_conflict() {
    let app = app().await;
    let payload = json!({"id": "u1", "address": "+5511999990000"});

    let (status, body) = send(&app, "POST", "/api/users", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], "u1");
    assert_eq!(body["onboarding_completed"], false);

    let (status, _) = send(&app, "POST", "/api/users", Some(payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn profile_lookup() {
    let app = app().await;
    let (status, _) = send(&app, "GET", "/api/users/ghost/profile", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app, "POST", "/api/users", Some(json!({"id": "u1", "address": "+55"}))).await;
    let (status, body) = send(&app, "GET", "/api/users/u1/profile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["onboarding_completed"], false);
}

#[tokio::test]
async fn message_returns_envelope() {
    let app = app().await;
    send(&app, "POST", "/api/users", Some(json!({"id": "u1", "address": "+55"}))).await;

    // No model and no keywords: the turn degrades to a clarification.
    let (status, body) = send(
        &app,
        "POST",
        "/api/messages",
        Some(json!({"user_id": "u1", "content": "hmm"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["handler"], "clarification");
    assert_eq!(body["metadata"]["source"], "fallback");
}

#[tokio::test]
async fn message_validation() {
    let app = app().await;

    let (status, _) = send(
        &app,
        "POST",
        "/api/messages",
        Some(json!({"user_id": "", "content": "oi"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        "POST",
        "/api/messages",
        Some(json!({"user_id": "u1", "content_type": "image", "image_base64": "***"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn image_without_payload_gets_menu() {
    let app = app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/api/messages",
        Some(json!({"user_id": "u1", "content_type": "image"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["handler"], "image_router");
    assert_eq!(body["metadata"]["intent"], "invalid_image");
}
