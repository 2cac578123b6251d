//! Audit log handlers: paginated read, filtered purge and filter options.

use axum::{extract::State, Json};
use uuid::Uuid;

use crate::dtos::audit::{AuditPage, AuditQuery, PurgeRequest, PurgeResponse};
use crate::middleware::{AuthActor, AuthUser};
use crate::services::store::AuditFilterOptions;
use crate::services::ServiceError;
use crate::utils::{ValidatedJson, ValidatedPath, ValidatedQuery};
use crate::AppState;

/// GET /organizations/:org_id/audit
#[tracing::instrument(skip(state, caller))]
pub async fn list_audit_logs(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
    ValidatedQuery(query): ValidatedQuery<AuditQuery>,
) -> Result<Json<AuditPage>, ServiceError> {
    Ok(Json(state.audit.query(&caller, org_id, query).await?))
}

/// DELETE /organizations/:org_id/audit
#[tracing::instrument(skip(state, actor))]
pub async fn purge_audit_logs(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<PurgeRequest>,
) -> Result<Json<PurgeResponse>, ServiceError> {
    let deleted_count = state.audit.purge(&actor, org_id, req).await?;
    Ok(Json(PurgeResponse { deleted_count }))
}

/// GET /organizations/:org_id/audit/filters
#[tracing::instrument(skip(state, caller))]
pub async fn audit_filter_options(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(org_id): ValidatedPath<Uuid>,
) -> Result<Json<AuditFilterOptions>, ServiceError> {
    Ok(Json(state.audit.filter_options(&caller, org_id).await?))
}
