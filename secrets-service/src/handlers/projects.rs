//! Project and project membership handlers.

use axum::{extract::State, http::StatusCode, Json};
use uuid::Uuid;

use crate::dtos::project::{
    AddProjectMemberRequest, CreateProjectRequest, ListProjectsQuery, ProjectDetail,
    UpdateProjectRequest,
};
use crate::dtos::{MembershipResponse, RemovalResponse, RoleChangeRequest};
use crate::middleware::{AuthActor, AuthUser};
use crate::models::{MemberDetail, Project, ProjectOverview};
use crate::services::ServiceError;
use crate::utils::{ValidatedJson, ValidatedPath, ValidatedQuery};
use crate::AppState;

// ============================================================================
// Projects
// ============================================================================

/// POST /projects
#[tracing::instrument(skip(state, actor, req))]
pub async fn create_project(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedJson(req): ValidatedJson<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ServiceError> {
    let project = state.projects.create(&actor, req).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /projects?orgId=
#[tracing::instrument(skip(state, caller))]
pub async fn list_projects(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedQuery(query): ValidatedQuery<ListProjectsQuery>,
) -> Result<Json<Vec<ProjectOverview>>, ServiceError> {
    Ok(Json(state.projects.list(&caller, query).await?))
}

/// GET /projects/:project_id
#[tracing::instrument(skip(state, caller))]
pub async fn get_project(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
) -> Result<Json<ProjectDetail>, ServiceError> {
    Ok(Json(state.projects.get(&caller, project_id).await?))
}

/// PUT /projects/:project_id
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_project(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<UpdateProjectRequest>,
) -> Result<Json<Project>, ServiceError> {
    Ok(Json(state.projects.update(&actor, project_id, req).await?))
}

/// DELETE /projects/:project_id
#[tracing::instrument(skip(state, actor))]
pub async fn delete_project(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
) -> Result<StatusCode, ServiceError> {
    state.projects.delete(&actor, project_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Members
// ============================================================================

/// GET /projects/:project_id/members
#[tracing::instrument(skip(state, caller))]
pub async fn list_project_members(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
) -> Result<Json<Vec<MemberDetail>>, ServiceError> {
    Ok(Json(state.projects.list_members(&caller, project_id).await?))
}

/// POST /projects/:project_id/members
#[tracing::instrument(skip(state, actor, req))]
pub async fn add_project_member(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<AddProjectMemberRequest>,
) -> Result<(StatusCode, Json<MembershipResponse>), ServiceError> {
    let membership = state.projects.add_member(&actor, project_id, req).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

/// PUT /projects/:project_id/members/:user_id
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_project_member_role(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((project_id, user_id)): ValidatedPath<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<RoleChangeRequest>,
) -> Result<Json<MembershipResponse>, ServiceError> {
    Ok(Json(
        state
            .projects
            .update_member_role(&actor, project_id, user_id, req)
            .await?,
    ))
}

/// DELETE /projects/:project_id/members/:user_id
#[tracing::instrument(skip(state, actor))]
pub async fn remove_project_member(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((project_id, user_id)): ValidatedPath<(Uuid, Uuid)>,
) -> Result<Json<RemovalResponse>, ServiceError> {
    Ok(Json(
        state
            .projects
            .remove_member(&actor, project_id, user_id)
            .await?,
    ))
}
