//! Organization, invitation and org membership handlers.

use axum::{extract::State, http::StatusCode, Json};
use uuid::Uuid;

use crate::dtos::organization::{
    AcceptInvitationRequest, AcceptInvitationResponse, CreateOrganizationRequest, InviteRequest,
    InviteResponse, OrganizationDetail, OrganizationResponse, UpdateOrganizationRequest,
};
use crate::dtos::{MembershipResponse, RemovalResponse, RoleChangeRequest};
use crate::middleware::{AuthActor, AuthUser};
use crate::services::ServiceError;
use crate::utils::{ValidatedJson, ValidatedPath};
use crate::AppState;

// ============================================================================
// Organizations
// ============================================================================

/// POST /organizations
#[tracing::instrument(skip(state, actor, req))]
pub async fn create_organization(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedJson(req): ValidatedJson<CreateOrganizationRequest>,
) -> Result<(StatusCode, Json<OrganizationResponse>), ServiceError> {
    let org = state.organizations.create(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(org)))
}

/// GET /organizations
#[tracing::instrument(skip(state, caller))]
pub async fn list_organizations(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<Vec<OrganizationResponse>>, ServiceError> {
    Ok(Json(state.organizations.list(&caller).await?))
}

/// GET /organizations/:org_id
#[tracing::instrument(skip(state, caller))]
pub async fn get_organization(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
) -> Result<Json<OrganizationDetail>, ServiceError> {
    Ok(Json(state.organizations.get(&caller, org_id).await?))
}

/// PUT /organizations/:org_id
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_organization(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateOrganizationRequest>,
) -> Result<Json<OrganizationResponse>, ServiceError> {
    Ok(Json(state.organizations.update(&actor, org_id, req).await?))
}

/// DELETE /organizations/:org_id
#[tracing::instrument(skip(state, actor))]
pub async fn delete_organization(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.organizations.delete(&actor, org_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Invitations
// ============================================================================

/// POST /organizations/:org_id/invite
///
/// The raw token appears only in this response.
#[tracing::instrument(skip(state, actor, req))]
pub async fn invite_member(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<InviteRequest>,
) -> Result<(StatusCode, Json<InviteResponse>), ServiceError> {
    let invitation = state.organizations.invite(&actor, org_id, req).await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

/// POST /organizations/:org_id/invite/accept
#[tracing::instrument(skip(state, actor, req))]
pub async fn accept_invitation(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<AcceptInvitationRequest>,
) -> Result<Json<AcceptInvitationResponse>, ServiceError> {
    Ok(Json(
        state
            .organizations
            .accept_invitation(&actor, org_id, req)
            .await?,
    ))
}

// ============================================================================
// Members
// ============================================================================

/// PUT /organizations/:org_id/members/:user_id
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_member_role(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((org_id, user_id)): ValidatedPath<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<RoleChangeRequest>,
) -> Result<Json<MembershipResponse>, ServiceError> {
    Ok(Json(
        state
            .organizations
            .update_member_role(&actor, org_id, user_id, req)
            .await?,
    ))
}

/// DELETE /organizations/:org_id/members/:user_id
#[tracing::instrument(skip(state, actor))]
pub async fn remove_member(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((org_id, user_id)): ValidatedPath<(Uuid, Uuid)>,
) -> Result<Json<RemovalResponse>, ServiceError> {
    Ok(Json(
        state
            .organizations
            .remove_member(&actor, org_id, user_id)
            .await?,
    ))
}
