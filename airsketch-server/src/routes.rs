use std::sync::Arc;

use airsketch_core::{GenerateError, GenerationRequest, GenerationResult, Generator};
use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Json, Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gallery::{Gallery, NewGalleryItem};
use crate::relay::DrawRelay;

/// Shared server state.
pub struct AppState {
    pub generator: Generator,
    pub relay: DrawRelay,
    pub gallery: Gallery,
}

impl AppState {
    pub fn new(generator: Generator) -> Self {
        Self {
            generator,
            relay: DrawRelay::default(),
            gallery: Gallery::default(),
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Dev servers of the drawing frontend.
pub const ALLOWED_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:3000"];

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(ALLOWED_ORIGINS.map(HeaderValue::from_static))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/generate", post(generate_image_handler))
        .route("/ws/draw", get(draw_socket_handler))
        .route("/api/gallery", post(save_to_gallery).get(list_gallery))
        .route("/api/gallery/{id}", delete(delete_from_gallery))
        .layer(cors())
        .with_state(state)
}

/// Failure response: `{"error": {"message", "type"}}`.
pub struct ApiError(GenerateError);

impl From<GenerateError> for ApiError {
    fn from(err: GenerateError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GenerateError::Decode(_) | GenerateError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GenerateError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GenerateError::Inference(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.kind(),
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn root(State(state): State<SharedState>) -> Json<Value> {
    let status = state.generator.manager().status();
    Json(json!({
        "service": "AirSketch Inference",
        "device": status.device,
        "status": "ready",
    }))
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    let status = state.generator.manager().status();
    Json(json!({
        "status": "healthy",
        "device": status.device,
        "model_loaded": status.is_loaded(),
        "model_state": status.state,
        "load_attempts": status.load_attempts,
        "last_error": status.last_error,
        "connections": state.relay.connections(),
    }))
}

async fn generate_image_handler(
    State(state): State<SharedState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResult>, ApiError> {
    let Json(request) =
        payload.map_err(|e| GenerateError::InvalidRequest(e.body_text()))?;

    // Inference blocks; keep it off the async workers.
    let generator = state.generator.clone();
    let result = tokio::task::spawn_blocking(move || generator.generate(&request))
        .await
        .map_err(|e| GenerateError::Inference(format!("generation task failed: {e}")))?;

    match result {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            if e.is_client_error() {
                warn!("rejected generation request: {e}");
            } else {
                error!("generation failed: {e}");
            }
            Err(e.into())
        }
    }
}

async fn draw_socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> Response {
    ws.on_upgrade(move |socket| async move { state.relay.serve(socket).await })
}

async fn save_to_gallery(
    State(state): State<SharedState>,
    Json(item): Json<NewGalleryItem>,
) -> Json<Value> {
    let id = state.gallery.create(item);
    info!("saved to gallery: {id}");
    Json(json!({"status": "success", "id": id}))
}

#[derive(Debug, Deserialize)]
struct GalleryQuery {
    user_id: Option<String>,
}

async fn list_gallery(
    State(state): State<SharedState>,
    Query(query): Query<GalleryQuery>,
) -> Json<Value> {
    let items = state.gallery.list(query.user_id.as_deref());
    Json(json!({"count": items.len(), "items": items}))
}

async fn delete_from_gallery(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match id.parse::<Uuid>() {
        Ok(id) => {
            if state.gallery.delete(id) {
                info!("deleted from gallery: {id}");
            }
        }
        Err(_) => warn!("delete for malformed gallery id {id:?}"),
    }
    (StatusCode::OK, Json(json!({"status": "deleted"})))
}
