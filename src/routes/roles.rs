//! Role governance route handlers
//!
//! Every mutating handler turns into a proposal; the live role only changes
//! once enough principals approve it.

use crate::auth::Claims;
use crate::error::{validation_error, ApiResult};
use crate::governance::{ProposalBundle, Role, RoleTransients};
use crate::models::{RoleListResponse, RoleRequest, SuccessResponse, ThresholdParams};
use crate::state::SharedState;
use crate::store::GovernanceStore;
use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

/// List live roles
pub async fn list_roles<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
) -> ApiResult<Json<SuccessResponse<RoleListResponse>>> {
    let roles = state.governance.list_roles().await?;
    let total = roles.len();

    Ok(Json(SuccessResponse::with_data(
        "Roles retrieved successfully.",
        RoleListResponse { roles, total },
    )))
}

/// Get one live role
pub async fn get_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<Role>>> {
    let role = state.governance.get_role(role_id).await?;
    Ok(Json(SuccessResponse::with_data("Role retrieved successfully.", role)))
}

/// Propose a new role
pub async fn create_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<RoleRequest>,
) -> ApiResult<(StatusCode, Json<SuccessResponse<ProposalBundle>>)> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    debug!("Create role request for '{}' from {}", payload.name, claims.actor());

    let (submit, required_approvals) = payload.into_submit();
    let bundle = state
        .governance
        .create(submit, claims.actor(), required_approvals)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Role proposal {}.", bundle.role.state),
            bundle,
        )),
    ))
}

/// Propose changes to a role
pub async fn update_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Extension(claims): Extension<Claims>,
    Path(role_id): Path<Uuid>,
    Json(payload): Json<RoleRequest>,
) -> ApiResult<Json<SuccessResponse<ProposalBundle>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let (submit, required_approvals) = payload.into_submit();
    let bundle = state
        .governance
        .update(role_id, submit, claims.actor(), required_approvals)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Role update proposal {}.", bundle.role.state),
        bundle,
    )))
}

/// Propose removal of a role
pub async fn delete_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Extension(claims): Extension<Claims>,
    Path(role_id): Path<Uuid>,
    Query(params): Query<ThresholdParams>,
) -> ApiResult<Json<SuccessResponse<ProposalBundle>>> {
    let bundle = state
        .governance
        .delete(role_id, claims.actor(), params.required_approvals)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Role deletion proposal {}.", bundle.role.state),
        bundle,
    )))
}

/// Approve the pending proposals of a role
pub async fn approve_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Extension(claims): Extension<Claims>,
    Path(role_id): Path<Uuid>,
    Json(params): Json<ThresholdParams>,
) -> ApiResult<Json<SuccessResponse<ProposalBundle>>> {
    let bundle = state
        .governance
        .approve(role_id, claims.actor(), params.required_approvals)
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Role proposal {}.", bundle.role.state),
        bundle,
    )))
}

/// Decline the pending proposals of a role
pub async fn decline_role<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Extension(claims): Extension<Claims>,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<ProposalBundle>>> {
    let bundle = state.governance.decline(role_id, claims.actor()).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Role proposal {}.", bundle.role.state),
        bundle,
    )))
}

/// Current review wave of a role
pub async fn role_transients<S: GovernanceStore>(
    State(state): State<SharedState<S>>,
    Path(role_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<RoleTransients>>> {
    let transients = state.governance.latest_transients(role_id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Role transients retrieved successfully.",
        transients,
    )))
}
