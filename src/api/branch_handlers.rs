use crate::api::handlers::{api_error, ApiError, AppState};
use crate::model::{Branch, Id, UserContext};
use crate::store::traits::Store;
use axum::{
    extract::{Path, State},
    response::Json,
    Json as RequestJson,
};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    /// `None` clears the password
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPinnedRequest {
    pub pinned: bool,
}

#[derive(Debug, Serialize)]
pub struct BranchResponse {
    #[serde(flatten)]
    pub branch: Branch,
    pub password_protected: bool,
}

impl From<Branch> for BranchResponse {
    fn from(branch: Branch) -> Self {
        Self {
            password_protected: branch.is_password_protected(),
            branch,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteBranchResponse {
    pub success: bool,
    pub retired_deploys: usize,
}

/// PUT /branches/{id}/password
pub async fn set_branch_password<S: Store>(
    Path(branch_id): Path<Id>,
    State(pipeline): State<AppState<S>>,
    user: UserContext,
    RequestJson(req): RequestJson<SetPasswordRequest>,
) -> Result<Json<BranchResponse>, ApiError> {
    let branch = pipeline
        .set_branch_password(branch_id, req.password.as_deref())
        .await
        .map_err(api_error)?;
    info!("Branch {} password changed by {}", branch_id, user.user_id);
    Ok(Json(branch.into()))
}

/// PUT /branches/{id}/pinned
pub async fn set_branch_pinned<S: Store>(
    Path(branch_id): Path<Id>,
    State(pipeline): State<AppState<S>>,
    RequestJson(req): RequestJson<SetPinnedRequest>,
) -> Result<Json<BranchResponse>, ApiError> {
    pipeline
        .set_branch_pinned(branch_id, req.pinned)
        .await
        .map(|branch| Json(branch.into()))
        .map_err(api_error)
}

/// DELETE /branches/{id}
/// Retires every deploy of the branch and removes it
pub async fn delete_branch<S: Store>(
    Path(branch_id): Path<Id>,
    State(pipeline): State<AppState<S>>,
    user: UserContext,
) -> Result<Json<DeleteBranchResponse>, ApiError> {
    let retired_deploys = pipeline.delete_branch(branch_id).await.map_err(api_error)?;
    info!("Branch {} deleted by {}", branch_id, user.user_id);
    Ok(Json(DeleteBranchResponse {
        success: true,
        retired_deploys,
    }))
}
