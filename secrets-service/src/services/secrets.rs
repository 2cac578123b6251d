//! Secret CRUD, dotenv import and export. Plaintext only exists in memory
//! between the request and the cipher.

use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::access::{AccessControl, ANY_MEMBER, ELEVATED};
use super::audit::AuditTrail;
use super::cipher::Cipher;
use super::identity::{Actor, CallerIdentity};
use super::store::Store;
use super::ServiceError;
use crate::dtos::secret::{
    CreateSecretRequest, ExportQuery, ImportSecretsRequest, ImportSummary, ListSecretsQuery,
    SecretResponse, SecretValueInput, SecretValueView, UpdateSecretRequest,
};
use crate::models::{
    AuditAction, AuditResource, Environment, NewSecretValue, Project, Scope, Secret,
    SecretWithValues,
};
use crate::utils::dotenv;
use crate::utils::validation::non_blank;

const MAX_KEY_LEN: usize = 256;

fn validate_key(key: &str) -> Result<(), ServiceError> {
    let len = key.chars().count();
    if len == 0 || len > MAX_KEY_LEN {
        return Err(ServiceError::Validation(format!(
            "Key must be 1-{} characters",
            MAX_KEY_LEN
        )));
    }
    if key.trim() != key {
        return Err(ServiceError::Validation(
            "Key must not start or end with whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Check the submitted set (non-empty, non-blank, one per environment).
fn validate_values(values: &[SecretValueInput]) -> Result<(), ServiceError> {
    if values.is_empty() {
        return Err(ServiceError::Validation(
            "At least one environment value is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for input in values {
        if input.value.trim().is_empty() {
            return Err(ServiceError::Validation(format!(
                "Value for {} must not be blank",
                input.environment
            )));
        }
        if !seen.insert(input.environment) {
            return Err(ServiceError::Validation(format!(
                "Environment {} appears more than once",
                input.environment
            )));
        }
    }
    Ok(())
}

fn environments(secret: &SecretWithValues) -> Vec<Environment> {
    secret.values.iter().map(|v| v.environment).collect()
}

#[derive(Clone)]
pub struct SecretService {
    store: Arc<dyn Store>,
    access: AccessControl,
    audit: AuditTrail,
    cipher: Cipher,
}

impl SecretService {
    pub fn new(
        store: Arc<dyn Store>,
        access: AccessControl,
        audit: AuditTrail,
        cipher: Cipher,
    ) -> Self {
        Self {
            store,
            access,
            audit,
            cipher,
        }
    }

    async fn load_project(&self, project_id: Uuid) -> Result<Project, ServiceError> {
        self.store
            .find_project(project_id)
            .await?
            .ok_or(ServiceError::NotFound("Project"))
    }

    /// The secret, provided it belongs to `project_id`.
    async fn load_secret(
        &self,
        project_id: Uuid,
        secret_id: Uuid,
    ) -> Result<SecretWithValues, ServiceError> {
        self.store
            .find_secret(secret_id)
            .await?
            .filter(|s| s.secret.project_id == project_id)
            .ok_or(ServiceError::NotFound("Secret"))
    }

    fn seal_all(&self, values: &[SecretValueInput]) -> Result<Vec<NewSecretValue>, ServiceError> {
        values
            .iter()
            .map(|input| {
                Ok(NewSecretValue {
                    environment: input.environment,
                    encrypted_value: self.cipher.seal(&input.value)?,
                })
            })
            .collect()
    }

    /// Decrypt every value, optionally only one environment. Any failure
    /// fails the whole read.
    fn reveal(
        &self,
        stored: SecretWithValues,
        environment: Option<Environment>,
    ) -> Result<SecretResponse, ServiceError> {
        let values = stored
            .values
            .iter()
            .filter(|v| environment.map_or(true, |env| v.environment == env))
            .map(|v| {
                Ok(SecretValueView {
                    environment: v.environment,
                    value: self.cipher.open(&v.encrypted_value)?,
                    updated_at: v.updated_at,
                })
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        let Secret {
            id,
            project_id,
            key,
            description,
            created_at,
            updated_at,
        } = stored.secret;
        Ok(SecretResponse {
            id,
            project_id,
            key,
            description,
            values,
            created_at,
            updated_at,
        })
    }

    /// Any project member. With an environment, secrets lacking a value
    /// there are left out.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn list(
        &self,
        caller: &CallerIdentity,
        project_id: Uuid,
        query: ListSecretsQuery,
    ) -> Result<Vec<SecretResponse>, ServiceError> {
        self.access
            .require_role(caller.user_id, Scope::Project(project_id), ANY_MEMBER)
            .await?;

        self.store
            .list_secrets(project_id)
            .await?
            .into_iter()
            .filter(|s| {
                query
                    .environment
                    .map_or(true, |env| s.values.iter().any(|v| v.environment == env))
            })
            .map(|s| self.reveal(s, query.environment))
            .collect()
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn create(
        &self,
        actor: &Actor,
        project_id: Uuid,
        req: CreateSecretRequest,
    ) -> Result<SecretResponse, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        validate_key(&req.key)?;
        validate_values(&req.values)?;
        let project = self.load_project(project_id).await?;

        let sealed = self.seal_all(&req.values)?;
        let secret = Secret::new(project_id, req.key, non_blank(req.description));
        let stored = self.store.create_secret(&secret, sealed).await?;

        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Create,
                AuditResource::Secret,
                json!({
                    "projectId": project_id,
                    "id": stored.secret.id,
                    "key": stored.secret.key,
                    "environments": environments(&stored),
                }),
            )
            .await?;

        self.reveal(stored, None)
    }

    /// Replaces every stored value with the submitted set. Environments not
    /// submitted are removed.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update(
        &self,
        actor: &Actor,
        project_id: Uuid,
        secret_id: Uuid,
        req: UpdateSecretRequest,
    ) -> Result<SecretResponse, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        validate_values(&req.values)?;
        let project = self.load_project(project_id).await?;
        let previous = self.load_secret(project_id, secret_id).await?;

        let sealed = self.seal_all(&req.values)?;
        let description = req.description.map(|d| non_blank(Some(d)));
        let stored = self
            .store
            .replace_secret_values(secret_id, description, sealed)
            .await?;

        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Update,
                AuditResource::Secret,
                json!({
                    "projectId": project_id,
                    "id": secret_id,
                    "key": stored.secret.key,
                    "environments": environments(&stored),
                    "previousEnvironments": environments(&previous),
                }),
            )
            .await?;

        self.reveal(stored, None)
    }

    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn delete(
        &self,
        actor: &Actor,
        project_id: Uuid,
        secret_id: Uuid,
    ) -> Result<(), ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        let project = self.load_project(project_id).await?;
        let existing = self.load_secret(project_id, secret_id).await?;

        self.store.delete_secret(secret_id).await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Delete,
                AuditResource::Secret,
                json!({
                    "projectId": project_id,
                    "id": secret_id,
                    "key": existing.secret.key,
                }),
            )
            .await?;

        Ok(())
    }

    /// Import dotenv text into one environment. Existing keys keep their
    /// other environments (merge), new keys are created. Each key is written
    /// atomically on its own.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn import(
        &self,
        actor: &Actor,
        project_id: Uuid,
        req: ImportSecretsRequest,
    ) -> Result<ImportSummary, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        let project = self.load_project(project_id).await?;

        let entries = dotenv::parse(&req.content);
        if entries.is_empty() {
            return Err(ServiceError::Validation(
                "No KEY=VALUE entries found".to_string(),
            ));
        }
        for (key, _) in &entries {
            validate_key(key)?;
        }

        let environment = req.environment;
        let mut summary = ImportSummary::default();
        let mut keys = Vec::with_capacity(entries.len());

        for (key, value) in entries {
            let sealed = NewSecretValue {
                environment,
                encrypted_value: self.cipher.seal(&value)?,
            };

            match self.store.find_secret_by_key(project_id, &key).await? {
                Some(existing) => {
                    let mut merged: Vec<NewSecretValue> = existing
                        .values
                        .into_iter()
                        .filter(|v| v.environment != environment)
                        .map(|v| NewSecretValue {
                            environment: v.environment,
                            encrypted_value: v.encrypted_value,
                        })
                        .collect();
                    merged.push(sealed);
                    self.store
                        .replace_secret_values(existing.secret.id, None, merged)
                        .await?;
                    summary.updated += 1;
                }
                None => {
                    let secret = Secret::new(project_id, key.clone(), None);
                    self.store.create_secret(&secret, vec![sealed]).await?;
                    summary.created += 1;
                }
            }
            keys.push(key);
        }

        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Create,
                AuditResource::Secret,
                json!({
                    "projectId": project_id,
                    "source": "import",
                    "environment": environment,
                    "keys": keys,
                    "created": summary.created,
                    "updated": summary.updated,
                }),
            )
            .await?;

        tracing::info!(
            project_id = %project_id,
            created = summary.created,
            updated = summary.updated,
            "Secrets imported"
        );
        Ok(summary)
    }

    /// Any project member. `KEY="value"` lines sorted by key.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn export(
        &self,
        caller: &CallerIdentity,
        project_id: Uuid,
        query: ExportQuery,
    ) -> Result<String, ServiceError> {
        self.access
            .require_role(caller.user_id, Scope::Project(project_id), ANY_MEMBER)
            .await?;

        let mut pairs = Vec::new();
        for stored in self.store.list_secrets(project_id).await? {
            if let Some(value) = stored
                .values
                .iter()
                .find(|v| v.environment == query.environment)
            {
                pairs.push((stored.secret.key.clone(), self.cipher.open(&value.encrypted_value)?));
            }
        }

        Ok(dotenv::render(
            pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        ))
    }
}
