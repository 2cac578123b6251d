//! Persistence boundary.
//!
//! Every method that enforces a multi-row invariant (last owner, membership
//! cascade, invitation consumption, duplicate keys, sole ownership) performs
//! its check and its writes as one atomic unit. Callers never need to hold
//! locks of their own.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::ServiceError;
use crate::models::{
    AuditLog, ExternalProfile, Invitation, MemberDetail, Membership, NewSecretValue,
    Organization, Project, ProjectOverview, Role, Scope, Secret, SecretWithValues, Session, User,
    UserSummary,
};

/// Audit log read filter. Empty strings are treated as absent.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub resource: Option<String>,
    pub user_id: Option<Uuid>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Audit log deletion filter. The org id is always implied.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub older_than: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl PurgeFilter {
    pub fn is_empty(&self) -> bool {
        self.older_than.is_none()
            && self.action.is_none()
            && self.resource.is_none()
            && self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditFilterOptions {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
    pub users: Vec<UserSummary>,
}

/// Partial profile update. `active_org_id: Some(None)` clears the field.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub active_org_id: Option<Option<Uuid>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<Option<String>>,
}

/// What a member removal touched besides the membership row itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalOutcome {
    pub removed_role: Option<Role>,
    pub project_memberships_removed: u64,
    pub active_org_cleared: bool,
}

/// A committed role change and the role it replaced.
#[derive(Debug, Clone)]
pub struct RoleUpdate {
    pub previous_role: Role,
    pub membership: Membership,
}

/// Result of redeeming an invitation.
#[derive(Debug, Clone)]
pub struct AcceptedInvitation {
    pub invitation: Invitation,
    pub membership: Membership,
    pub active_org_set: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), ServiceError>;

    // ==================== Users & sessions ====================

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError>;
    /// Owner of a non-expired API token with the given hash.
    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, ServiceError>;
    /// Find by email, or create from the profile when none exists.
    async fn upsert_user(&self, profile: &ExternalProfile) -> Result<User, ServiceError>;
    /// Fails with `NotAMember` if a new active org is one the user does not belong to,
    /// and `DuplicateKey` if the email is taken.
    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<User, ServiceError>;
    async fn set_api_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError>;
    /// Fails with `OwnershipConflict` if the user is the only owner of any organization.
    async fn delete_user(&self, user_id: Uuid) -> Result<(), ServiceError>;

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError>;
    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError>;

    // ==================== Organizations ====================

    /// Inserts the organization and its first owner; becomes the owner's active org if unset.
    async fn create_organization(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<(), ServiceError>;
    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError>;
    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Organization, Role)>, ServiceError>;
    async fn rename_organization(
        &self,
        org_id: Uuid,
        name: &str,
    ) -> Result<Organization, ServiceError>;
    /// Clears every user's active org pointing here, then deletes with cascade.
    async fn delete_organization(&self, org_id: Uuid) -> Result<(), ServiceError>;

    // ==================== Memberships ====================

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError>;
    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetail>, ServiceError>;
    /// Changes a role on behalf of `actor_id`. The actor's authority and the
    /// last-owner rule are checked against the roles held under the lock.
    async fn update_member_role(
        &self,
        scope: Scope,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<RoleUpdate, ServiceError>;
    /// Removes an organization membership together with the user's project
    /// memberships in that organization and their active-org pointer.
    async fn remove_organization_member(
        &self,
        org_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError>;
    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Membership, ServiceError>;
    async fn remove_project_member(
        &self,
        project_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError>;

    // ==================== Invitations ====================

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError>;
    /// Consumes the invitation and creates the membership. If the user already
    /// belongs to the organization the invitation is still consumed and
    /// `AlreadyMember` is returned.
    async fn accept_invitation(
        &self,
        org_id: Uuid,
        token_hash: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AcceptedInvitation, ServiceError>;

    // ==================== Projects ====================

    /// Inserts the project with the creator as its owner.
    async fn create_project(&self, project: &Project, owner_id: Uuid) -> Result<(), ServiceError>;
    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError>;
    async fn list_organization_projects(&self, org_id: Uuid) -> Result<Vec<Project>, ServiceError>;
    /// Projects in every organization the user belongs to, optionally one org only.
    async fn list_user_projects(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<ProjectOverview>, ServiceError>;
    async fn update_project(
        &self,
        project_id: Uuid,
        update: ProjectUpdate,
    ) -> Result<Project, ServiceError>;
    async fn delete_project(&self, project_id: Uuid) -> Result<(), ServiceError>;

    // ==================== Secrets ====================

    /// Fails with `DuplicateKey` when the key already exists in the project.
    async fn create_secret(
        &self,
        secret: &Secret,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError>;
    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<SecretWithValues>, ServiceError>;
    async fn find_secret_by_key(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<SecretWithValues>, ServiceError>;
    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretWithValues>, ServiceError>;
    /// Deletes every stored value and writes `values` in their place.
    async fn replace_secret_values(
        &self,
        secret_id: Uuid,
        description: Option<Option<String>>,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError>;
    async fn delete_secret(&self, secret_id: Uuid) -> Result<(), ServiceError>;

    // ==================== Audit logs ====================

    async fn insert_audit_log(&self, log: &AuditLog) -> Result<(), ServiceError>;
    /// Newest first. Returns the page and the total number of matches.
    async fn find_audit_logs(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLog>, i64), ServiceError>;
    /// Deletes matching rows except protected ones; returns the count deleted.
    async fn purge_audit_logs(
        &self,
        org_id: Uuid,
        filter: &PurgeFilter,
        protected_actions: &[String],
    ) -> Result<u64, ServiceError>;
    async fn audit_filter_options(&self, org_id: Uuid) -> Result<AuditFilterOptions, ServiceError>;
}
