use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Json as RequestJson,
};
use log::error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::PipelineError;
use crate::logic::{guess_content_type, ActivatedDeploy, DeployPipeline, StartedDeploy};
use crate::model::{BranchAddress, Deploy, Id, Manifest, ManifestEntry, UserContext};
use crate::store::traits::Store;

pub type AppState<S> = Arc<DeployPipeline<S>>;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Authorization(_) => StatusCode::UNAUTHORIZED,
        PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::Conflict(_) => StatusCode::CONFLICT,
        PipelineError::Integrity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::UnsafePath(_) | PipelineError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Map a pipeline failure to the JSON error body
pub fn api_error(err: PipelineError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {:#}", err);
    }
    (status, Json(ErrorResponse::new(&err.to_string())))
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        api_error(self).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct StartDeployRequest {
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivateRequest {
    pub concurrency: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct UploadAssetResponse {
    pub sha256: String,
    pub content_length: i64,
    pub already_existed: bool,
}

/// POST /orgs/{org}/games/{game}/branches/{slug}/deploys
pub async fn start_deploy<S: Store>(
    Path((org_id, game_id, slug)): Path<(Id, Id, String)>,
    State(pipeline): State<AppState<S>>,
    user: UserContext,
    RequestJson(req): RequestJson<StartDeployRequest>,
) -> Result<(StatusCode, Json<StartedDeploy>), ApiError> {
    let address = BranchAddress::new(org_id, game_id, slug);
    let started = pipeline
        .start_incremental(&address, Manifest::new(req.manifest), &user.user_id)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(started)))
}

/// PUT /deploys/{id}/assets/{*path}
pub async fn upload_asset<S: Store>(
    Path((deploy_id, path)): Path<(Id, String)>,
    State(pipeline): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadAssetResponse>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| guess_content_type(&path));

    let outcome = pipeline
        .upload_asset(deploy_id, &path, &body, &content_type)
        .await
        .map_err(api_error)?;
    Ok(Json(UploadAssetResponse {
        sha256: outcome.object.sha256,
        content_length: outcome.object.content_length,
        already_existed: outcome.already_existed,
    }))
}

/// POST /deploys/{id}/activate
pub async fn activate_deploy<S: Store>(
    Path(deploy_id): Path<Id>,
    State(pipeline): State<AppState<S>>,
    req: Option<RequestJson<ActivateRequest>>,
) -> Result<Json<ActivatedDeploy>, ApiError> {
    let req = req.map(|RequestJson(req)| req).unwrap_or_default();
    let activated = pipeline
        .activate_incremental(deploy_id, req.concurrency)
        .await
        .map_err(api_error)?;
    Ok(Json(activated))
}

/// POST /orgs/{org}/games/{game}/branches/{slug}/archive
pub async fn full_deploy<S: Store>(
    Path((org_id, game_id, slug)): Path<(Id, Id, String)>,
    State(pipeline): State<AppState<S>>,
    user: UserContext,
    body: Bytes,
) -> Result<(StatusCode, Json<ActivatedDeploy>), ApiError> {
    let address = BranchAddress::new(org_id, game_id, slug);
    let activated = pipeline
        .full_deploy(&address, body.to_vec(), &user.user_id)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(activated)))
}

/// GET /deploys/{id}
pub async fn get_deploy<S: Store>(
    Path(deploy_id): Path<Id>,
    State(pipeline): State<AppState<S>>,
) -> Result<Json<Deploy>, ApiError> {
    pipeline
        .get_deploy(deploy_id)
        .await
        .map(Json)
        .map_err(api_error)
}
