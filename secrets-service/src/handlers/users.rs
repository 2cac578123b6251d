//! Current-user handlers.

use axum::{extract::State, http::StatusCode, Json};

use crate::dtos::user::{ApiTokenResponse, MeResponse, UpdateMeRequest};
use crate::middleware::{AuthActor, AuthUser};
use crate::models::User;
use crate::services::ServiceError;
use crate::utils::ValidatedJson;
use crate::AppState;

/// GET /users/me
#[tracing::instrument(skip(state, caller))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<MeResponse>, ServiceError> {
    Ok(Json(state.users.me(&caller).await?))
}

/// PUT /users/me
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedJson(req): ValidatedJson<UpdateMeRequest>,
) -> Result<Json<User>, ServiceError> {
    Ok(Json(state.users.update_me(&actor, req).await?))
}

/// DELETE /users/me
///
/// Refused while the caller is the sole owner of any organization.
#[tracing::instrument(skip(state, actor))]
pub async fn delete_me(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<StatusCode, ServiceError> {
    state.users.delete_account(&actor).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /users/me/token
#[tracing::instrument(skip(state, actor))]
pub async fn rotate_api_token(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
) -> Result<(StatusCode, Json<ApiTokenResponse>), ServiceError> {
    let token = state.users.rotate_api_token(&actor).await?;
    Ok((StatusCode::CREATED, Json(token)))
}
