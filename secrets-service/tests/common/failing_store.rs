//! A store whose organization and project deletions always fail, for checking
//! that nothing is recorded for a deletion that did not happen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrets_service::{
    models::{
        AuditLog, ExternalProfile, Invitation, MemberDetail, Membership, NewSecretValue,
        Organization, Project, ProjectOverview, Role, Scope, Secret, SecretWithValues, Session,
        User,
    },
    services::{
        store::{
            AcceptedInvitation, AuditFilter, AuditFilterOptions, ProjectUpdate, PurgeFilter,
            RemovalOutcome, RoleUpdate, UserUpdate,
        },
        MemoryStore, ServiceError, Store,
    },
};
use uuid::Uuid;

#[derive(Default)]
pub struct FailingDeletes {
    inner: MemoryStore,
}

fn refused() -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!("delete refused by test store"))
}

#[async_trait]
impl Store for FailingDeletes {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.inner.health_check().await
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        self.inner.find_user(user_id).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        self.inner.find_user_by_email(email).await
    }

    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, ServiceError> {
        self.inner.find_user_by_token_hash(token_hash, now).await
    }

    async fn upsert_user(&self, profile: &ExternalProfile) -> Result<User, ServiceError> {
        self.inner.upsert_user(profile).await
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<User, ServiceError> {
        self.inner.update_user(user_id, update).await
    }

    async fn set_api_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        self.inner.set_api_token(user_id, token_hash, expires_at).await
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<(), ServiceError> {
        self.inner.delete_user(user_id).await
    }

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        self.inner.insert_session(session).await
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        self.inner.find_session(session_id).await
    }

    async fn create_organization(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<(), ServiceError> {
        self.inner.create_organization(org, owner_id).await
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        self.inner.find_organization(org_id).await
    }

    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Organization, Role)>, ServiceError> {
        self.inner.list_user_organizations(user_id).await
    }

    async fn rename_organization(
        &self,
        org_id: Uuid,
        name: &str,
    ) -> Result<Organization, ServiceError> {
        self.inner.rename_organization(org_id, name).await
    }

    async fn delete_organization(&self, _org_id: Uuid) -> Result<(), ServiceError> {
        Err(refused())
    }

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError> {
        self.inner.find_membership(user_id, scope).await
    }

    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetail>, ServiceError> {
        self.inner.list_members(scope).await
    }

    async fn update_member_role(
        &self,
        scope: Scope,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<RoleUpdate, ServiceError> {
        self.inner
            .update_member_role(scope, actor_id, user_id, role)
            .await
    }

    async fn remove_organization_member(
        &self,
        org_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        self.inner
            .remove_organization_member(org_id, actor_id, user_id)
            .await
    }

    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Membership, ServiceError> {
        self.inner.add_project_member(project_id, user_id, role).await
    }

    async fn remove_project_member(
        &self,
        project_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        self.inner
            .remove_project_member(project_id, actor_id, user_id)
            .await
    }

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError> {
        self.inner.insert_invitation(invitation).await
    }

    async fn accept_invitation(
        &self,
        org_id: Uuid,
        token_hash: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AcceptedInvitation, ServiceError> {
        self.inner
            .accept_invitation(org_id, token_hash, user_id, now)
            .await
    }

    async fn create_project(&self, project: &Project, owner_id: Uuid) -> Result<(), ServiceError> {
        self.inner.create_project(project, owner_id).await
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError> {
        self.inner.find_project(project_id).await
    }

    async fn list_organization_projects(&self, org_id: Uuid) -> Result<Vec<Project>, ServiceError> {
        self.inner.list_organization_projects(org_id).await
    }

    async fn list_user_projects(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<ProjectOverview>, ServiceError> {
        self.inner.list_user_projects(user_id, org_id).await
    }

    async fn update_project(
        &self,
        project_id: Uuid,
        update: ProjectUpdate,
    ) -> Result<Project, ServiceError> {
        self.inner.update_project(project_id, update).await
    }

    async fn delete_project(&self, _project_id: Uuid) -> Result<(), ServiceError> {
        Err(refused())
    }

    async fn create_secret(
        &self,
        secret: &Secret,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        self.inner.create_secret(secret, values).await
    }

    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<SecretWithValues>, ServiceError> {
        self.inner.find_secret(secret_id).await
    }

    async fn find_secret_by_key(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<SecretWithValues>, ServiceError> {
        self.inner.find_secret_by_key(project_id, key).await
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretWithValues>, ServiceError> {
        self.inner.list_secrets(project_id).await
    }

    async fn replace_secret_values(
        &self,
        secret_id: Uuid,
        description: Option<Option<String>>,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        self.inner
            .replace_secret_values(secret_id, description, values)
            .await
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<(), ServiceError> {
        self.inner.delete_secret(secret_id).await
    }

    async fn insert_audit_log(&self, log: &AuditLog) -> Result<(), ServiceError> {
        self.inner.insert_audit_log(log).await
    }

    async fn find_audit_logs(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLog>, i64), ServiceError> {
        self.inner
            .find_audit_logs(org_id, filter, limit, offset)
            .await
    }

    async fn purge_audit_logs(
        &self,
        org_id: Uuid,
        filter: &PurgeFilter,
        protected_actions: &[String],
    ) -> Result<u64, ServiceError> {
        self.inner
            .purge_audit_logs(org_id, filter, protected_actions)
            .await
    }

    async fn audit_filter_options(&self, org_id: Uuid) -> Result<AuditFilterOptions, ServiceError> {
        self.inner.audit_filter_options(org_id).await
    }
}
