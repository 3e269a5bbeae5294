//! HTTP surface: message ingestion, user registration and profile lookup.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::dispatch::{ContentType, Dispatcher, Inbound};
use crate::error::DatabaseError;
use crate::llm::ImageInput;
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub db: Arc<dyn Database>,
}

/// Build the Axum router.
pub fn api_routes(dispatcher: Arc<Dispatcher>, db: Arc<dyn Database>) -> Router {
    let state = AppState { dispatcher, db };

    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(post_message))
        .route("/api/users", post(create_user))
        .route("/api/users/{id}/profile", get(get_profile))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "coach-core"
    }))
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct MessageRequest {
    user_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    content_type: ContentType,
    image_base64: Option<String>,
    media_type: Option<String>,
}

async fn post_message(State(state): State<AppState>, Json(body): Json<MessageRequest>) -> impl IntoResponse {
    if body.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "user_id is required"})),
        );
    }

    let inbound = match body.content_type {
        ContentType::Text => Inbound::text(body.user_id, body.content),
        ContentType::Image => {
            let image = match body.image_base64.as_deref() {
                Some(data) => match ImageInput::from_base64(data, body.media_type.as_deref()) {
                    Ok(image) => Some(image),
                    Err(e) => {
                        warn!(error = %e, "Rejected invalid base64 image");
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(json!({"error": "image_base64 is not valid base64"})),
                        );
                    }
                },
                None => None,
            };
            Inbound {
                user_id: body.user_id,
                content: body.content,
                content_type: ContentType::Image,
                image,
            }
        }
    };

    let envelope = state.dispatcher.handle(inbound).await;
    (StatusCode::OK, Json(json!(envelope)))
}

// ── Users ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateUserRequest {
    id: String,
    address: String,
}

async fn create_user(State(state): State<AppState>, Json(body): Json<CreateUserRequest>) -> impl IntoResponse {
    if body.id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "id is required"})),
        );
    }
    match state.db.create_user(&body.id, &body.address).await {
        Ok(user) => {
            info!(user_id = %user.id, "User registered");
            (StatusCode::CREATED, Json(json!(user)))
        }
        Err(DatabaseError::Constraint(_)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "User already exists"})),
        ),
        Err(e) => {
            warn!(error = %e, "User registration failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Registration failed"})),
            )
        }
    }
}

async fn get_profile(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let user = match state.db.get_user(&id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "User not found"})),
            );
        }
        Err(e) => {
            warn!(user_id = %id, error = %e, "Profile lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Lookup failed"})),
            );
        }
    };
    let profile = state.db.get_profile(&id).await.ok().flatten().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "user_id": user.id,
            "onboarding_completed": user.onboarding_completed,
            "profile": profile,
        })),
    )
}
