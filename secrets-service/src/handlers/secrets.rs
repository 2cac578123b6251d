//! Secret handlers. Request bodies carry plaintext values and are never
//! recorded on spans.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::dtos::secret::{
    CreateSecretRequest, ExportQuery, ImportSecretsRequest, ImportSummary, ListSecretsQuery,
    SecretResponse, UpdateSecretRequest,
};
use crate::middleware::{AuthActor, AuthUser};
use crate::services::ServiceError;
use crate::utils::{ValidatedJson, ValidatedPath, ValidatedQuery};
use crate::AppState;

/// GET /projects/:project_id/secrets?environment=
#[tracing::instrument(skip(state, caller))]
pub async fn list_secrets(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedQuery(query): ValidatedQuery<ListSecretsQuery>,
) -> Result<Json<Vec<SecretResponse>>, ServiceError> {
    Ok(Json(state.secrets.list(&caller, project_id, query).await?))
}

/// POST /projects/:project_id/secrets
#[tracing::instrument(skip(state, actor, req))]
pub async fn create_secret(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateSecretRequest>,
) -> Result<(StatusCode, Json<SecretResponse>), ServiceError> {
    let secret = state.secrets.create(&actor, project_id, req).await?;
    Ok((StatusCode::CREATED, Json(secret)))
}

/// PUT /projects/:project_id/secrets/:secret_id
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_secret(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((project_id, secret_id)): ValidatedPath<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<UpdateSecretRequest>,
) -> Result<Json<SecretResponse>, ServiceError> {
    Ok(Json(
        state
            .secrets
            .update(&actor, project_id, secret_id, req)
            .await?,
    ))
}

/// DELETE /projects/:project_id/secrets/:secret_id
#[tracing::instrument(skip(state, actor))]
pub async fn delete_secret(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath((project_id, secret_id)): ValidatedPath<(Uuid, Uuid)>,
) -> Result<StatusCode, ServiceError> {
    state.secrets.delete(&actor, project_id, secret_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /projects/:project_id/secrets/import
#[tracing::instrument(skip(state, actor, req))]
pub async fn import_secrets(
    State(state): State<AppState>,
    AuthActor(actor): AuthActor,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedJson(req): ValidatedJson<ImportSecretsRequest>,
) -> Result<Json<ImportSummary>, ServiceError> {
    Ok(Json(state.secrets.import(&actor, project_id, req).await?))
}

/// GET /projects/:project_id/secrets/export?environment=
///
/// Responds with a dotenv document as a file download.
#[tracing::instrument(skip(state, caller))]
pub async fn export_secrets(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    ValidatedPath(project_id): ValidatedPath<Uuid>,
    ValidatedQuery(query): ValidatedQuery<ExportQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let disposition = format!("attachment; filename=\".env.{}\"", query.environment);
    let body = state.secrets.export(&caller, project_id, query).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    ))
}
