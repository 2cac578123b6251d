//! The caller's own account: profile, active organization, API token, deletion.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use super::audit::AuditTrail;
use super::identity::{generate_token, hash_token, Actor, CallerIdentity};
use super::store::{Store, UserUpdate};
use super::ServiceError;
use crate::dtos::organization::OrganizationResponse;
use crate::dtos::user::{ActiveOrganization, ApiTokenResponse, MeResponse, UpdateMeRequest};
use crate::models::{AuditAction, AuditResource, User};
use crate::utils::validation::trimmed;

#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn Store>,
    audit: AuditTrail,
    api_token_ttl: Duration,
}

impl UserService {
    pub fn new(store: Arc<dyn Store>, audit: AuditTrail, api_token_ttl: Duration) -> Self {
        Self {
            store,
            audit,
            api_token_ttl,
        }
    }

    async fn load(&self, caller: &CallerIdentity) -> Result<User, ServiceError> {
        self.store
            .find_user(caller.user_id)
            .await?
            .ok_or(ServiceError::NotFound("User"))
    }

    /// Profile, organizations with roles, and the active organization's projects.
    pub async fn me(&self, caller: &CallerIdentity) -> Result<MeResponse, ServiceError> {
        let user = self.load(caller).await?;
        let memberships = self.store.list_user_organizations(user.id).await?;

        let mut active_organization = None;
        let mut organizations = Vec::with_capacity(memberships.len());
        for (org, role) in memberships {
            if Some(org.id) == user.active_org_id {
                let projects = self.store.list_organization_projects(org.id).await?;
                active_organization = Some(ActiveOrganization {
                    organization: OrganizationResponse::new(org.clone(), role),
                    projects,
                });
            }
            organizations.push(OrganizationResponse::new(org, role));
        }

        Ok(MeResponse {
            user,
            organizations,
            active_organization,
        })
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update_me(
        &self,
        actor: &Actor,
        req: UpdateMeRequest,
    ) -> Result<User, ServiceError> {
        let name = req
            .name
            .as_deref()
            .map(|n| trimmed("Name", n, 2, 100))
            .transpose()?;
        let email = req.email.map(|e| e.trim().to_lowercase());

        if let Some(email) = &email {
            if let Some(existing) = self.store.find_user_by_email(email).await? {
                if existing.id != actor.user_id() {
                    return Err(ServiceError::DuplicateKey(
                        "Email is already in use".to_string(),
                    ));
                }
            }
        }

        let mut changed = Vec::new();
        if name.is_some() {
            changed.push("name");
        }
        if email.is_some() {
            changed.push("email");
        }
        if req.active_org_id.is_some() {
            changed.push("activeOrgId");
        }

        let user = self
            .store
            .update_user(
                actor.user_id(),
                UserUpdate {
                    name,
                    email,
                    active_org_id: req.active_org_id.map(Some),
                },
            )
            .await?;

        if let Some(org_id) = user.active_org_id {
            if !changed.is_empty() {
                self.audit
                    .record(
                        actor,
                        org_id,
                        AuditAction::Update,
                        AuditResource::User,
                        json!({ "userId": user.id, "fields": changed }),
                    )
                    .await?;
            }
        }

        Ok(user)
    }

    /// Issue a new CLI token. The previous one stops working immediately.
    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn rotate_api_token(&self, actor: &Actor) -> Result<ApiTokenResponse, ServiceError> {
        let token = generate_token();
        let expires_at = Utc::now() + self.api_token_ttl;
        self.store
            .set_api_token(actor.user_id(), &hash_token(&token), expires_at)
            .await?;

        if let Some(org_id) = actor.identity.active_org_id {
            self.audit
                .record(
                    actor,
                    org_id,
                    AuditAction::Update,
                    AuditResource::User,
                    json!({ "userId": actor.user_id(), "fields": ["apiToken"] }),
                )
                .await?;
        }

        tracing::info!("API token rotated");
        Ok(ApiTokenResponse { token, expires_at })
    }

    /// Refused while the caller is the only owner of any organization. Each
    /// organization the user left gets a detached audit entry.
    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn delete_account(&self, actor: &Actor) -> Result<(), ServiceError> {
        let user = self
            .store
            .find_user(actor.user_id())
            .await?
            .ok_or(ServiceError::NotFound("User"))?;
        let memberships = self.store.list_user_organizations(user.id).await?;

        self.store.delete_user(user.id).await?;

        for (org, role) in memberships {
            self.audit
                .record_detached(
                    actor,
                    org.id,
                    AuditAction::Delete,
                    AuditResource::User,
                    json!({ "userId": user.id, "email": user.email, "role": role }),
                )
                .await?;
        }

        tracing::info!("Account deleted");
        Ok(())
    }
}
