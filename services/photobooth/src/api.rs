use crate::commit::{CommitService, RecordPage};
use crate::config::ApiConfig;
use crate::database;
use crate::error::BoothError;
use crate::normalizer::NORMALIZED_CONTENT_TYPE;
use crate::object_store::{ObjectDownload, ObjectStore};
use crate::records::{Record, RecordMetadata, RecordQuery};
use crate::staging::SessionId;
use crate::upload::{StagedImage, UploadService};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Header carrying the authenticated session id
pub const SESSION_HEADER: &str = "x-session-id";

const MAX_PAGE_SIZE: i64 = 200;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadService>,
    pub commits: Arc<CommitService>,
    pub objects: Arc<dyn ObjectStore>,
    /// Present when bindings and records live in PostgreSQL
    pub database: Option<PgPool>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl BoothError {
    fn status_code(&self) -> StatusCode {
        match self {
            BoothError::NoFile => StatusCode::BAD_REQUEST,
            BoothError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            BoothError::Processing(_) | BoothError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BoothError::NoStagedImage => StatusCode::CONFLICT,
            BoothError::NotFound(_) => StatusCode::NOT_FOUND,
            BoothError::Storage(_) | BoothError::Session(_) | BoothError::RecordPersist(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BoothError::SessionPersist { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BoothError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, code = self.code(), "Request failed");
        } else {
            debug!(error = %self, code = self.code(), "Request rejected");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Session id taken from the [`SESSION_HEADER`] request header
#[derive(Debug, Clone)]
pub struct Session(pub SessionId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Session(SessionId::new(v)))
            .ok_or_else(|| {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorResponse {
                        error: format!("Missing {SESSION_HEADER} header"),
                        code: "NO_SESSION".to_string(),
                    }),
                )
            })
    }
}

/// Query parameters for the record list
#[derive(Debug, Deserialize)]
pub struct RecordListQuery {
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Offset for pagination
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Discard response
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscardResponse {
    pub discarded: bool,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/photosession/select", post(select_capture))
        .route("/photosession/upload", post(upload_file))
        .route(
            "/photosession/preview-image",
            get(preview_image).delete(discard_image),
        )
        .route("/photosession/details", post(commit_details))
        .route("/photosession/:record_id", axum::routing::delete(delete_record))
        .route("/photosession/:record_id/image", get(record_image))
        .route("/api/sessions", get(list_records))
        .route("/api/sessions/:record_id", get(get_record))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photobooth-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if let Err(e) = state.objects.health_check().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "object_store": "unavailable",
                "error": e.to_string()
            })),
        );
    }

    if let Some(pool) = &state.database {
        if let Err(e) = database::ping(pool).await {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected",
                    "error": e.to_string()
                })),
            );
        }
    }

    let database = if state.database.is_some() {
        "connected"
    } else {
        "in-memory"
    };
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "object_store": "available",
            "database": database
        })),
    )
}

/// Stage a camera capture
#[instrument(skip(state, body), fields(session_id = %session.0))]
async fn select_capture(
    State(state): State<AppState>,
    session: Session,
    body: Bytes,
) -> Result<(StatusCode, Json<StagedImage>), BoothError> {
    let staged = state.uploads.select_from_capture(&session.0, body).await?;
    Ok((StatusCode::CREATED, Json(staged)))
}

/// Stage an uploaded file; the declared type comes from `Content-Type`
#[instrument(skip(state, headers, body), fields(session_id = %session.0))]
async fn upload_file(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StagedImage>), BoothError> {
    let declared_mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let staged = state
        .uploads
        .upload_file(&session.0, body, declared_mime)
        .await?;
    Ok((StatusCode::CREATED, Json(staged)))
}

async fn preview_image(
    State(state): State<AppState>,
    session: Session,
) -> Result<Response, BoothError> {
    let download = state.uploads.preview(&session.0).await?;
    Ok(image_response(download))
}

async fn discard_image(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<DiscardResponse>, BoothError> {
    let discarded = state.uploads.discard(&session.0).await?;
    Ok(Json(DiscardResponse { discarded }))
}

/// Commit the staged image with the submitted details
#[instrument(skip(state, metadata), fields(session_id = %session.0))]
async fn commit_details(
    State(state): State<AppState>,
    session: Session,
    Json(metadata): Json<RecordMetadata>,
) -> Result<(StatusCode, Json<Record>), BoothError> {
    let record = state.commits.commit(&session.0, metadata).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_records(
    State(state): State<AppState>,
    Query(params): Query<RecordListQuery>,
) -> Result<Json<RecordPage>, BoothError> {
    let query = RecordQuery {
        limit: Some(params.limit.clamp(1, MAX_PAGE_SIZE)),
        offset: Some(params.offset.max(0)),
    };
    Ok(Json(state.commits.list(&query).await?))
}

async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<Record>, BoothError> {
    Ok(Json(state.commits.get(record_id).await?))
}

async fn record_image(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Response, BoothError> {
    let download = state.commits.stream(record_id).await?;
    Ok(image_response(download))
}

async fn delete_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<StatusCode, BoothError> {
    state.commits.delete(record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream an object body with the normalized content type.
fn image_response(download: ObjectDownload) -> Response {
    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(NORMALIZED_CONTENT_TYPE),
        ),
        (header::CONTENT_LENGTH, HeaderValue::from(download.object.length)),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
    ];
    (headers, Body::from_stream(download.body)).into_response()
}

/// Start the photobooth API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting photobooth API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
