//! PostgreSQL store.
//!
//! Invariant checks run inside a transaction after `SELECT ... FOR UPDATE` on
//! the scope's membership rows, so concurrent changes to one scope serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, QueryBuilder, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    AcceptedInvitation, AuditFilter, AuditFilterOptions, ProjectUpdate, PurgeFilter,
    RemovalOutcome, RoleUpdate, Store, UserUpdate,
};
use crate::models::{
    AuditLog, ExternalProfile, Invitation, MemberDetail, Membership, NewSecretValue,
    Organization, Project, ProjectOverview, Role, Scope, ScopeKind, Secret, SecretValue,
    SecretWithValues, Session, User, UserSummary,
};
use crate::services::access::{authorize_roster_change, MembershipChange};
use crate::services::ServiceError;

const SLUG_TAKEN: &str = "A project with this slug already exists in the organization";

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct MembershipRow {
    user_id: Uuid,
    role: Role,
    created_at: DateTime<Utc>,
}

impl MembershipRow {
    fn into_membership(self, scope: Scope) -> Membership {
        Membership {
            user_id: self.user_id,
            scope,
            role: self.role,
            joined_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct MemberDetailRow {
    #[sqlx(flatten)]
    user: UserSummary,
    role: Role,
    joined_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct OrganizationRoleRow {
    #[sqlx(flatten)]
    org: Organization,
    role: Role,
}

#[derive(FromRow)]
struct ProjectOverviewRow {
    #[sqlx(flatten)]
    project: Project,
    role: Option<Role>,
    org_role: Role,
    member_count: i64,
    secret_count: i64,
}

fn member_table(kind: ScopeKind) -> (&'static str, &'static str) {
    match kind {
        ScopeKind::Organization => ("organization_members", "org_id"),
        ScopeKind::Project => ("project_members", "project_id"),
    }
}

/// Replace the generic duplicate message with one naming what collided.
fn on_unique(message: &'static str) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |e| match ServiceError::from(e) {
        ServiceError::DuplicateKey(_) => ServiceError::DuplicateKey(message.to_string()),
        other => other,
    }
}

fn push_audit_filter(qb: &mut QueryBuilder<'_, Postgres>, org_id: Uuid, filter: &AuditFilter) {
    qb.push(" WHERE org_id = ").push_bind(org_id);
    if let Some(action) = &filter.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(resource) = &filter.resource {
        qb.push(" AND resource = ").push_bind(resource.clone());
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(start) = filter.start_date {
        qb.push(" AND created_at >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        qb.push(" AND created_at <= ").push_bind(end);
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock every membership row of the scope and return (user, role) pairs.
    async fn lock_scope_members(
        tx: &mut Transaction<'_, Postgres>,
        scope: Scope,
    ) -> Result<Vec<Membership>, ServiceError> {
        let (table, column) = member_table(scope.kind());
        let rows = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT user_id, role, created_at FROM {} WHERE {} = $1 FOR UPDATE",
            table, column
        ))
        .bind(scope.id())
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_membership(scope)).collect())
    }

    async fn values_for(&self, secret: Secret) -> Result<SecretWithValues, ServiceError> {
        let values = sqlx::query_as::<_, SecretValue>(
            "SELECT * FROM secret_values WHERE secret_id = $1 ORDER BY environment",
        )
        .bind(secret.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(SecretWithValues { secret, values })
    }

    async fn insert_values(
        tx: &mut Transaction<'_, Postgres>,
        secret_id: Uuid,
        values: Vec<NewSecretValue>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SecretValue>, ServiceError> {
        let mut stored = Vec::with_capacity(values.len());
        for value in values {
            let value = value.into_value(secret_id, now);
            sqlx::query(
                r#"
                INSERT INTO secret_values (id, secret_id, environment, encrypted_value, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(value.id)
            .bind(value.secret_id)
            .bind(value.environment)
            .bind(&value.encrypted_value)
            .bind(value.created_at)
            .bind(value.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(on_unique("Each environment may appear only once per secret"))?;
            stored.push(value);
        }
        stored.sort_by_key(|v| v.environment);
        Ok(stored)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!("Database health check failed: {}", e);
            ServiceError::from(e)
        })?;
        Ok(())
    }

    // ==================== Users & sessions ====================

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, ServiceError> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE api_token_hash = $1 AND api_token_expires_at > $2",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn upsert_user(&self, profile: &ExternalProfile) -> Result<User, ServiceError> {
        if let Some(user) = self.find_user_by_email(&profile.email).await? {
            return Ok(user);
        }

        let name = profile
            .name
            .clone()
            .unwrap_or_else(|| profile.email.split('@').next().unwrap_or_default().to_string());
        let user = User::new(profile.email.to_lowercase(), name, profile.image.clone());

        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, email, name, image, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.image)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;

        match inserted.map_err(ServiceError::from) {
            Ok(_) => Ok(user),
            // Lost a race with a concurrent first login for the same email.
            Err(ServiceError::DuplicateKey(_)) => self
                .find_user_by_email(&profile.email)
                .await?
                .ok_or(ServiceError::NotFound("User")),
            Err(e) => Err(e),
        }
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<User, ServiceError> {
        let mut tx = self.pool.begin().await?;

        if let Some(Some(org_id)) = update.active_org_id {
            let member = sqlx::query_scalar::<_, i32>(
                "SELECT 1 FROM organization_members WHERE user_id = $1 AND org_id = $2 FOR SHARE",
            )
            .bind(user_id)
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await?;
            if member.is_none() {
                return Err(ServiceError::NotAMember(ScopeKind::Organization));
            }
        }

        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET name = COALESCE($2, name),
                email = COALESCE($3, email),
                active_org_id = CASE WHEN $4 THEN $5 ELSE active_org_id END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(&update.name)
        .bind(&update.email)
        .bind(update.active_org_id.is_some())
        .bind(update.active_org_id.flatten())
        .fetch_optional(&mut *tx)
        .await
        .map_err(on_unique("Email is already in use"))?
        .ok_or(ServiceError::NotFound("User"))?;

        tx.commit().await?;
        Ok(user)
    }

    async fn set_api_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE users SET api_token_hash = $2, api_token_expires_at = $3, updated_at = now() WHERE id = $1",
        )
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("User"));
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        // Freeze the owner rosters of every org this user owns.
        sqlx::query(
            r#"
            SELECT user_id FROM organization_members
            WHERE org_id IN (
                SELECT org_id FROM organization_members WHERE user_id = $1 AND role = 'owner'
            )
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let sole_owned = sqlx::query_scalar::<_, String>(
            r#"
            SELECT o.name
            FROM organization_members m
            JOIN organizations o ON o.id = m.org_id
            WHERE m.user_id = $1
              AND m.role = 'owner'
              AND NOT EXISTS (
                  SELECT 1 FROM organization_members other
                  WHERE other.org_id = m.org_id
                    AND other.role = 'owner'
                    AND other.user_id <> $1
              )
            ORDER BY o.name
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(name) = sole_owned {
            return Err(ServiceError::OwnershipConflict(name));
        }

        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("User"));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, expires_at, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.expires_at)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ==================== Organizations ====================

    async fn create_organization(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO organizations (id, name, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO organization_members (user_id, org_id, role, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(owner_id)
        .bind(org.id)
        .bind(Role::Owner)
        .bind(org.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE users SET active_org_id = $1 WHERE id = $2 AND active_org_id IS NULL",
        )
        .bind(org.id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Organization, Role)>, ServiceError> {
        let rows = sqlx::query_as::<_, OrganizationRoleRow>(
            r#"
            SELECT o.id, o.name, o.created_at, o.updated_at, m.role
            FROM organizations o
            JOIN organization_members m ON m.org_id = o.id
            WHERE m.user_id = $1
            ORDER BY o.name, o.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| (r.org, r.role)).collect())
    }

    async fn rename_organization(
        &self,
        org_id: Uuid,
        name: &str,
    ) -> Result<Organization, ServiceError> {
        sqlx::query_as::<_, Organization>(
            "UPDATE organizations SET name = $2, updated_at = now() WHERE id = $1 RETURNING *",
        )
        .bind(org_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ServiceError::NotFound("Organization"))
    }

    async fn delete_organization(&self, org_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE users SET active_org_id = NULL WHERE active_org_id = $1")
            .bind(org_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(org_id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Organization"));
        }

        tx.commit().await?;
        Ok(())
    }

    // ==================== Memberships ====================

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError> {
        let (table, column) = member_table(scope.kind());
        let row = sqlx::query_as::<_, MembershipRow>(&format!(
            "SELECT user_id, role, created_at FROM {} WHERE user_id = $1 AND {} = $2",
            table, column
        ))
        .bind(user_id)
        .bind(scope.id())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.into_membership(scope)))
    }

    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetail>, ServiceError> {
        let (table, column) = member_table(scope.kind());
        let rows = sqlx::query_as::<_, MemberDetailRow>(&format!(
            r#"
            SELECT u.id, u.email, u.name, u.image, m.role, m.created_at AS joined_at
            FROM {} m
            JOIN users u ON u.id = m.user_id
            WHERE m.{} = $1
            ORDER BY m.created_at, u.id
            "#,
            table, column
        ))
        .bind(scope.id())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| MemberDetail {
                user: r.user,
                role: r.role,
                joined_at: r.joined_at,
            })
            .collect())
    }

    async fn update_member_role(
        &self,
        scope: Scope,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<RoleUpdate, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let members = Self::lock_scope_members(&mut tx, scope).await?;
        let current =
            authorize_roster_change(&members, actor_id, user_id, MembershipChange::Role(role))?;

        let (table, column) = member_table(scope.kind());
        let row = sqlx::query_as::<_, MembershipRow>(&format!(
            "UPDATE {} SET role = $3 WHERE user_id = $1 AND {} = $2 RETURNING user_id, role, created_at",
            table, column
        ))
        .bind(user_id)
        .bind(scope.id())
        .bind(role)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RoleUpdate {
            previous_role: current.role,
            membership: row.into_membership(scope),
        })
    }

    async fn remove_organization_member(
        &self,
        org_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let members = Self::lock_scope_members(&mut tx, Scope::Organization(org_id)).await?;
        let current =
            authorize_roster_change(&members, actor_id, user_id, MembershipChange::Removal)?;

        let projects = sqlx::query(
            r#"
            DELETE FROM project_members pm
            USING projects p
            WHERE pm.project_id = p.id AND p.org_id = $1 AND pm.user_id = $2
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM organization_members WHERE org_id = $1 AND user_id = $2")
            .bind(org_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let cleared = sqlx::query(
            "UPDATE users SET active_org_id = NULL WHERE id = $1 AND active_org_id = $2",
        )
        .bind(user_id)
        .bind(org_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RemovalOutcome {
            removed_role: Some(current.role),
            project_memberships_removed: projects.rows_affected(),
            active_org_cleared: cleared.rows_affected() > 0,
        })
    }

    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Membership, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let org_id = sqlx::query_scalar::<_, Uuid>("SELECT org_id FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ServiceError::NotFound("Project"))?;

        // Share lock keeps a concurrent org removal from slipping in between.
        let org_member = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM organization_members WHERE org_id = $1 AND user_id = $2 FOR SHARE",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if org_member.is_none() {
            return Err(ServiceError::NotOrgMember);
        }

        let row = sqlx::query_as::<_, MembershipRow>(
            r#"
            INSERT INTO project_members (user_id, project_id, role, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (user_id, project_id) DO NOTHING
            RETURNING user_id, role, created_at
            "#,
        )
        .bind(user_id)
        .bind(project_id)
        .bind(role)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            ServiceError::AlreadyMember("User is already a member of this project".to_string())
        })?;

        tx.commit().await?;
        Ok(row.into_membership(Scope::Project(project_id)))
    }

    async fn remove_project_member(
        &self,
        project_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let members = Self::lock_scope_members(&mut tx, Scope::Project(project_id)).await?;
        let current =
            authorize_roster_change(&members, actor_id, user_id, MembershipChange::Removal)?;

        sqlx::query("DELETE FROM project_members WHERE project_id = $1 AND user_id = $2")
            .bind(project_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RemovalOutcome {
            removed_role: Some(current.role),
            ..RemovalOutcome::default()
        })
    }

    // ==================== Invitations ====================

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO invitations (id, org_id, email, role, token_hash, invited_by, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(invitation.id)
        .bind(invitation.org_id)
        .bind(&invitation.email)
        .bind(invitation.role)
        .bind(&invitation.token_hash)
        .bind(invitation.invited_by)
        .bind(invitation.expires_at)
        .bind(invitation.used_at)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await
        .map_err(on_unique("Invitation token collision"))?;
        Ok(())
    }

    async fn accept_invitation(
        &self,
        org_id: Uuid,
        token_hash: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AcceptedInvitation, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let mut invitation = sqlx::query_as::<_, Invitation>(
            r#"
            SELECT * FROM invitations
            WHERE org_id = $1 AND token_hash = $2 AND used_at IS NULL AND expires_at > $3
            FOR UPDATE
            "#,
        )
        .bind(org_id)
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ServiceError::NotFound("Invitation"))?;

        sqlx::query("UPDATE invitations SET used_at = $2 WHERE id = $1")
            .bind(invitation.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        invitation.used_at = Some(now);

        let inserted = sqlx::query_as::<_, MembershipRow>(
            r#"
            INSERT INTO organization_members (user_id, org_id, role, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, org_id) DO NOTHING
            RETURNING user_id, role, created_at
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(invitation.role)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            // The invitation stays consumed even though nothing was granted.
            tx.commit().await?;
            return Err(ServiceError::AlreadyMember(
                "You are already a member of this organization".to_string(),
            ));
        };

        let activated = sqlx::query(
            "UPDATE users SET active_org_id = $1 WHERE id = $2 AND active_org_id IS NULL",
        )
        .bind(org_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AcceptedInvitation {
            invitation,
            membership: row.into_membership(Scope::Organization(org_id)),
            active_org_set: activated.rows_affected() > 0,
        })
    }

    // ==================== Projects ====================

    async fn create_project(&self, project: &Project, owner_id: Uuid) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO projects (id, org_id, name, slug, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(project.id)
        .bind(project.org_id)
        .bind(&project.name)
        .bind(&project.slug)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(on_unique(SLUG_TAKEN))?;

        sqlx::query(
            "INSERT INTO project_members (user_id, project_id, role, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(owner_id)
        .bind(project.id)
        .bind(Role::Owner)
        .bind(project.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_organization_projects(&self, org_id: Uuid) -> Result<Vec<Project>, ServiceError> {
        Ok(sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE org_id = $1 ORDER BY name, id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_user_projects(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<ProjectOverview>, ServiceError> {
        let rows = sqlx::query_as::<_, ProjectOverviewRow>(
            r#"
            SELECT p.*,
                   pm.role AS role,
                   om.role AS org_role,
                   (SELECT COUNT(*) FROM project_members c WHERE c.project_id = p.id) AS member_count,
                   (SELECT COUNT(*) FROM secrets s WHERE s.project_id = p.id) AS secret_count
            FROM projects p
            JOIN organization_members om ON om.org_id = p.org_id AND om.user_id = $1
            LEFT JOIN project_members pm ON pm.project_id = p.id AND pm.user_id = $1
            WHERE ($2::uuid IS NULL OR p.org_id = $2)
            ORDER BY p.name, p.id
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ProjectOverview {
                project: r.project,
                role: r.role,
                org_role: r.org_role,
                member_count: r.member_count,
                secret_count: r.secret_count,
            })
            .collect())
    }

    async fn update_project(
        &self,
        project_id: Uuid,
        update: ProjectUpdate,
    ) -> Result<Project, ServiceError> {
        sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects
            SET name = COALESCE($2, name),
                slug = COALESCE($3, slug),
                description = CASE WHEN $4 THEN $5 ELSE description END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(&update.name)
        .bind(&update.slug)
        .bind(update.description.is_some())
        .bind(update.description.flatten())
        .fetch_optional(&self.pool)
        .await
        .map_err(on_unique(SLUG_TAKEN))?
        .ok_or(ServiceError::NotFound("Project"))
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Project"));
        }
        Ok(())
    }

    // ==================== Secrets ====================

    async fn create_secret(
        &self,
        secret: &Secret,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO secrets (id, project_id, key, description, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(secret.id)
        .bind(secret.project_id)
        .bind(&secret.key)
        .bind(&secret.description)
        .bind(secret.created_at)
        .bind(secret.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match ServiceError::from(e) {
            ServiceError::DuplicateKey(_) => ServiceError::DuplicateKey(format!(
                "Secret '{}' already exists in this project",
                secret.key
            )),
            other => other,
        })?;

        let values = Self::insert_values(&mut tx, secret.id, values, secret.created_at).await?;

        tx.commit().await?;
        Ok(SecretWithValues {
            secret: secret.clone(),
            values,
        })
    }

    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<SecretWithValues>, ServiceError> {
        let secret = sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE id = $1")
            .bind(secret_id)
            .fetch_optional(&self.pool)
            .await?;
        match secret {
            Some(secret) => Ok(Some(self.values_for(secret).await?)),
            None => Ok(None),
        }
    }

    async fn find_secret_by_key(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<SecretWithValues>, ServiceError> {
        let secret =
            sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE project_id = $1 AND key = $2")
                .bind(project_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match secret {
            Some(secret) => Ok(Some(self.values_for(secret).await?)),
            None => Ok(None),
        }
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretWithValues>, ServiceError> {
        let secrets = sqlx::query_as::<_, Secret>(
            "SELECT * FROM secrets WHERE project_id = $1 ORDER BY key",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let values = sqlx::query_as::<_, SecretValue>(
            r#"
            SELECT sv.*
            FROM secret_values sv
            JOIN secrets s ON s.id = sv.secret_id
            WHERE s.project_id = $1
            ORDER BY sv.environment
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_secret: HashMap<Uuid, Vec<SecretValue>> = HashMap::new();
        for value in values {
            by_secret.entry(value.secret_id).or_default().push(value);
        }

        Ok(secrets
            .into_iter()
            .map(|secret| {
                let values = by_secret.remove(&secret.id).unwrap_or_default();
                SecretWithValues { secret, values }
            })
            .collect())
    }

    async fn replace_secret_values(
        &self,
        secret_id: Uuid,
        description: Option<Option<String>>,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let secret = sqlx::query_as::<_, Secret>(
            r#"
            UPDATE secrets
            SET description = CASE WHEN $2 THEN $3 ELSE description END,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(secret_id)
        .bind(description.is_some())
        .bind(description.flatten())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(ServiceError::NotFound("Secret"))?;

        sqlx::query("DELETE FROM secret_values WHERE secret_id = $1")
            .bind(secret_id)
            .execute(&mut *tx)
            .await?;

        let values = Self::insert_values(&mut tx, secret_id, values, secret.updated_at).await?;

        tx.commit().await?;
        Ok(SecretWithValues { secret, values })
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<(), ServiceError> {
        let result = sqlx::query("DELETE FROM secrets WHERE id = $1")
            .bind(secret_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("Secret"));
        }
        Ok(())
    }

    // ==================== Audit logs ====================

    async fn insert_audit_log(&self, log: &AuditLog) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, user_id, org_id, action, resource, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(log.user_id)
        .bind(log.org_id)
        .bind(&log.action)
        .bind(&log.resource)
        .bind(&log.metadata)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_audit_logs(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLog>, i64), ServiceError> {
        let mut count_q = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM audit_logs");
        push_audit_filter(&mut count_q, org_id, filter);
        let total: i64 = count_q
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await?;

        let mut data_q = QueryBuilder::<Postgres>::new("SELECT * FROM audit_logs");
        push_audit_filter(&mut data_q, org_id, filter);
        data_q
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let logs = data_q
            .build_query_as::<AuditLog>()
            .fetch_all(&self.pool)
            .await?;

        Ok((logs, total))
    }

    async fn purge_audit_logs(
        &self,
        org_id: Uuid,
        filter: &PurgeFilter,
        protected_actions: &[String],
    ) -> Result<u64, ServiceError> {
        let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM audit_logs WHERE org_id = ");
        qb.push_bind(org_id);
        if let Some(older_than) = filter.older_than {
            qb.push(" AND created_at < ").push_bind(older_than);
        }
        if let Some(action) = &filter.action {
            qb.push(" AND action = ").push_bind(action.clone());
        }
        if let Some(resource) = &filter.resource {
            qb.push(" AND resource = ").push_bind(resource.clone());
        }
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if !protected_actions.is_empty() {
            qb.push(" AND NOT (action = ANY(")
                .push_bind(protected_actions.to_vec())
                .push(") OR (resource || '.' || action) = ANY(")
                .push_bind(protected_actions.to_vec())
                .push("))");
        }

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn audit_filter_options(&self, org_id: Uuid) -> Result<AuditFilterOptions, ServiceError> {
        let actions = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT action FROM audit_logs WHERE org_id = $1 ORDER BY action",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let resources = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT resource FROM audit_logs WHERE org_id = $1 ORDER BY resource",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let users = sqlx::query_as::<_, UserSummary>(
            r#"
            SELECT DISTINCT u.id, u.email, u.name, u.image
            FROM audit_logs a
            JOIN users u ON u.id = a.user_id
            WHERE a.org_id = $1
            ORDER BY u.name, u.email
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(AuditFilterOptions {
            actions,
            resources,
            users,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_tables_follow_scope() {
        assert_eq!(
            member_table(ScopeKind::Organization),
            ("organization_members", "org_id")
        );
        assert_eq!(
            member_table(ScopeKind::Project),
            ("project_members", "project_id")
        );
    }

    #[test]
    fn audit_filter_binds_only_present_fields() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM audit_logs");
        let filter = AuditFilter {
            action: Some("delete".to_string()),
            user_id: Some(Uuid::new_v4()),
            ..AuditFilter::default()
        };
        push_audit_filter(&mut qb, Uuid::new_v4(), &filter);

        assert_eq!(
            qb.sql(),
            "SELECT * FROM audit_logs WHERE org_id = $1 AND action = $2 AND user_id = $3"
        );
    }
}
