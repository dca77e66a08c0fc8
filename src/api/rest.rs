//! REST API Handlers
//!
//! JSON endpoints for every lifecycle operation of the driver.

use crate::driver::{
    CapabilityValidation, ControllerCapabilities, CreateVolumeRequest, CreatedVolume,
    CredentialSource, DeleteVolumeRequest, Driver, NodeInfo, PublishVolumeRequest,
    StageVolumeRequest, UnpublishVolumeRequest, UnstageVolumeRequest,
    ValidateCapabilitiesRequest,
};
use crate::domain::ports::VolumeCapability;
use crate::error::{Error, ErrorKind};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Body of `DELETE /v1/volumes/:id`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeBody {
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// Body of `POST /v1/volumes/:id/validate`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVolumeBody {
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

impl ApiErrorResponse {
    pub fn status(err: &Error) -> StatusCode {
        match (err, err.kind()) {
            (Error::NotFound(_) | Error::BucketNotFound { .. }, _) => StatusCode::NOT_FOUND,
            (_, ErrorKind::InvalidInput) => StatusCode::BAD_REQUEST,
            (_, ErrorKind::PreconditionConflict) => StatusCode::CONFLICT,
            (_, ErrorKind::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            (_, ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            (_, ErrorKind::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(status: StatusCode) -> &'static str {
        match status {
            StatusCode::NOT_FOUND => "not_found",
            StatusCode::BAD_REQUEST => "invalid_argument",
            StatusCode::CONFLICT => "conflict",
            StatusCode::SERVICE_UNAVAILABLE => "unavailable",
            StatusCode::GATEWAY_TIMEOUT => "timeout",
            _ => "internal_error",
        }
    }
}

/// Error wrapper turning driver failures into JSON responses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = ApiErrorResponse::status(&self.0);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }
        (
            status,
            Json(ApiErrorResponse {
                error: ApiErrorResponse::code(status).into(),
                message: self.0.to_string(),
                retryable: self.0.is_retryable(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    driver: Arc<Driver>,
}

impl RestRouter {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            driver: self.driver,
        };

        Router::new()
            // Controller endpoints
            .route("/v1/volumes", post(create_volume))
            .route("/v1/volumes/:id", delete(delete_volume))
            .route("/v1/volumes/:id/validate", post(validate_volume))
            .route("/v1/controller", get(controller_capabilities))
            // Node endpoints
            .route("/v1/node", get(node_info))
            .route("/v1/node/stage", post(stage_volume))
            .route("/v1/node/unstage", post(unstage_volume))
            .route("/v1/node/publish", post(publish_volume))
            .route("/v1/node/unpublish", post(unpublish_volume))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    driver: Arc<Driver>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> ApiResult<(StatusCode, Json<CreatedVolume>)> {
    info!("Create volume request: {}", request.name);
    let volume = state.driver.create_volume(&request).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

/// Volume ids may contain a slash, so clients percent-encode it
async fn delete_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<DeleteVolumeBody>>,
) -> ApiResult<StatusCode> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    state
        .driver
        .delete_volume(&DeleteVolumeRequest {
            volume_id: id,
            credentials: body.credentials,
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn validate_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ValidateVolumeBody>,
) -> ApiResult<Json<CapabilityValidation>> {
    let validation = state
        .driver
        .validate_volume_capabilities(&ValidateCapabilitiesRequest {
            volume_id: id,
            volume_capabilities: body.volume_capabilities,
            credentials: body.credentials,
        })
        .await?;
    Ok(Json(validation))
}

async fn controller_capabilities(State(state): State<AppState>) -> Json<ControllerCapabilities> {
    Json(state.driver.controller_capabilities())
}

async fn node_info(State(state): State<AppState>) -> Json<NodeInfo> {
    Json(state.driver.node_info())
}

async fn stage_volume(
    State(state): State<AppState>,
    Json(request): Json<StageVolumeRequest>,
) -> ApiResult<StatusCode> {
    state.driver.stage_volume(&request).await?;
    Ok(StatusCode::OK)
}

async fn unstage_volume(
    State(state): State<AppState>,
    Json(request): Json<UnstageVolumeRequest>,
) -> ApiResult<StatusCode> {
    state.driver.unstage_volume(&request).await?;
    Ok(StatusCode::OK)
}

async fn publish_volume(
    State(state): State<AppState>,
    Json(request): Json<PublishVolumeRequest>,
) -> ApiResult<StatusCode> {
    state.driver.publish_volume(&request).await?;
    Ok(StatusCode::OK)
}

async fn unpublish_volume(
    State(state): State<AppState>,
    Json(request): Json<UnpublishVolumeRequest>,
) -> ApiResult<StatusCode> {
    state.driver.unpublish_volume(&request).await?;
    Ok(StatusCode::OK)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check endpoint
async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}
