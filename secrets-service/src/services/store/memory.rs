//! In-process store for tests and local development.
//!
//! All state sits behind one mutex and every method takes it exactly once, so
//! each call is atomic with respect to every other call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    AcceptedInvitation, AuditFilter, AuditFilterOptions, ProjectUpdate, PurgeFilter,
    RemovalOutcome, RoleUpdate, Store, UserUpdate,
};
use crate::models::{
    AuditLog, ExternalProfile, Invitation, MemberDetail, Membership, NewSecretValue,
    Organization, Project, ProjectOverview, Role, Scope, ScopeKind, Secret, SecretValue,
    SecretWithValues, Session, User,
};
use crate::services::access::{authorize_roster_change, MembershipChange};
use crate::services::ServiceError;

/// (scope id, user id)
type MemberKey = (Uuid, Uuid);

#[derive(Debug, Clone)]
struct MemberRow {
    role: Role,
    joined_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    organizations: HashMap<Uuid, Organization>,
    org_members: HashMap<MemberKey, MemberRow>,
    projects: HashMap<Uuid, Project>,
    project_members: HashMap<MemberKey, MemberRow>,
    secrets: HashMap<Uuid, Secret>,
    secret_values: HashMap<Uuid, Vec<SecretValue>>,
    invitations: Vec<Invitation>,
    audit_logs: Vec<AuditLog>,
}

impl State {
    fn members(&self, kind: ScopeKind) -> &HashMap<MemberKey, MemberRow> {
        match kind {
            ScopeKind::Organization => &self.org_members,
            ScopeKind::Project => &self.project_members,
        }
    }

    fn members_mut(&mut self, kind: ScopeKind) -> &mut HashMap<MemberKey, MemberRow> {
        match kind {
            ScopeKind::Organization => &mut self.org_members,
            ScopeKind::Project => &mut self.project_members,
        }
    }

    fn membership(&self, user_id: Uuid, scope: Scope) -> Option<Membership> {
        self.members(scope.kind())
            .get(&(scope.id(), user_id))
            .map(|row| Membership {
                user_id,
                scope,
                role: row.role,
                joined_at: row.joined_at,
            })
    }

    fn other_owners(&self, scope: Scope, user_id: Uuid) -> usize {
        self.members(scope.kind())
            .iter()
            .filter(|((scope_id, member), row)| {
                *scope_id == scope.id() && *member != user_id && row.role == Role::Owner
            })
            .count()
    }

    fn roster(&self, scope: Scope) -> Vec<Membership> {
        self.members(scope.kind())
            .iter()
            .filter(|((scope_id, _), _)| *scope_id == scope.id())
            .map(|((_, user_id), row)| Membership {
                user_id: *user_id,
                scope,
                role: row.role,
                joined_at: row.joined_at,
            })
            .collect()
    }

    fn email_taken(&self, email: &str, except: Option<Uuid>) -> bool {
        self.users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(email) && Some(u.id) != except)
    }

    fn with_values(&self, secret: &Secret) -> SecretWithValues {
        let mut values = self
            .secret_values
            .get(&secret.id)
            .cloned()
            .unwrap_or_default();
        values.sort_by_key(|v| v.environment);
        SecretWithValues {
            secret: secret.clone(),
            values,
        }
    }

    fn remove_project(&mut self, project_id: Uuid) {
        self.projects.remove(&project_id);
        self.project_members.retain(|(pid, _), _| *pid != project_id);
        let secret_ids: Vec<Uuid> = self
            .secrets
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.id)
            .collect();
        for id in secret_ids {
            self.secrets.remove(&id);
            self.secret_values.remove(&id);
        }
    }
}

fn matches_audit_filter(log: &AuditLog, filter: &AuditFilter) -> bool {
    filter.action.as_ref().map_or(true, |a| log.action == *a)
        && filter.resource.as_ref().map_or(true, |r| log.resource == *r)
        && filter.user_id.map_or(true, |u| log.user_id == Some(u))
        && filter.start_date.map_or(true, |d| log.created_at >= d)
        && filter.end_date.map_or(true, |d| log.created_at <= d)
}

fn matches_purge_filter(log: &AuditLog, filter: &PurgeFilter) -> bool {
    filter.older_than.map_or(true, |d| log.created_at < d)
        && filter.action.as_ref().map_or(true, |a| log.action == *a)
        && filter.resource.as_ref().map_or(true, |r| log.resource == *r)
        && filter.user_id.map_or(true, |u| log.user_id == Some(u))
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, ServiceError> {
        self.state
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), ServiceError> {
        self.state().map(|_| ())
    }

    // ==================== Users & sessions ====================

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.state()?.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(self
            .state()?
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, ServiceError> {
        Ok(self
            .state()?
            .users
            .values()
            .find(|u| {
                u.api_token_hash.as_deref() == Some(token_hash)
                    && u.api_token_expires_at.map_or(false, |exp| now < exp)
            })
            .cloned())
    }

    async fn upsert_user(&self, profile: &ExternalProfile) -> Result<User, ServiceError> {
        let mut state = self.state()?;
        if let Some(user) = state
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(&profile.email))
        {
            return Ok(user.clone());
        }

        let name = profile
            .name
            .clone()
            .unwrap_or_else(|| profile.email.split('@').next().unwrap_or_default().to_string());
        let user = User::new(profile.email.to_lowercase(), name, profile.image.clone());
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, user_id: Uuid, update: UserUpdate) -> Result<User, ServiceError> {
        let mut state = self.state()?;
        if !state.users.contains_key(&user_id) {
            return Err(ServiceError::NotFound("User"));
        }
        if let Some(email) = &update.email {
            if state.email_taken(email, Some(user_id)) {
                return Err(ServiceError::DuplicateKey(
                    "Email is already in use".to_string(),
                ));
            }
        }
        if let Some(Some(org_id)) = update.active_org_id {
            if state
                .membership(user_id, Scope::Organization(org_id))
                .is_none()
            {
                return Err(ServiceError::NotAMember(ScopeKind::Organization));
            }
        }

        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(ServiceError::NotFound("User"))?;
        if let Some(name) = update.name {
            user.name = name;
        }
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(active_org_id) = update.active_org_id {
            user.active_org_id = active_org_id;
        }
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_api_token(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or(ServiceError::NotFound("User"))?;
        user.api_token_hash = Some(token_hash.to_string());
        user.api_token_expires_at = Some(expires_at);
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_user(&self, user_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if !state.users.contains_key(&user_id) {
            return Err(ServiceError::NotFound("User"));
        }

        let mut owned: Vec<Uuid> = state
            .org_members
            .iter()
            .filter(|((_, member), row)| *member == user_id && row.role == Role::Owner)
            .map(|((org_id, _), _)| *org_id)
            .collect();
        owned.sort();
        for org_id in owned {
            if state.other_owners(Scope::Organization(org_id), user_id) == 0 {
                let name = state
                    .organizations
                    .get(&org_id)
                    .map(|o| o.name.clone())
                    .unwrap_or_default();
                return Err(ServiceError::OwnershipConflict(name));
            }
        }

        state.org_members.retain(|(_, member), _| *member != user_id);
        state.project_members.retain(|(_, member), _| *member != user_id);
        state.sessions.retain(|_, s| s.user_id != user_id);
        for invitation in state.invitations.iter_mut() {
            if invitation.invited_by == Some(user_id) {
                invitation.invited_by = None;
            }
        }
        for log in state.audit_logs.iter_mut() {
            if log.user_id == Some(user_id) {
                log.user_id = None;
            }
        }
        state.users.remove(&user_id);
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        self.state()?.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        Ok(self.state()?.sessions.get(&session_id).cloned())
    }

    // ==================== Organizations ====================

    async fn create_organization(
        &self,
        org: &Organization,
        owner_id: Uuid,
    ) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        let owner = state
            .users
            .get_mut(&owner_id)
            .ok_or(ServiceError::NotFound("User"))?;
        if owner.active_org_id.is_none() {
            owner.active_org_id = Some(org.id);
        }
        state.organizations.insert(org.id, org.clone());
        state.org_members.insert(
            (org.id, owner_id),
            MemberRow {
                role: Role::Owner,
                joined_at: org.created_at,
            },
        );
        Ok(())
    }

    async fn find_organization(&self, org_id: Uuid) -> Result<Option<Organization>, ServiceError> {
        Ok(self.state()?.organizations.get(&org_id).cloned())
    }

    async fn list_user_organizations(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<(Organization, Role)>, ServiceError> {
        let state = self.state()?;
        let mut orgs: Vec<(Organization, Role)> = state
            .org_members
            .iter()
            .filter(|((_, member), _)| *member == user_id)
            .filter_map(|((org_id, _), row)| {
                state
                    .organizations
                    .get(org_id)
                    .map(|org| (org.clone(), row.role))
            })
            .collect();
        orgs.sort_by(|a, b| a.0.name.cmp(&b.0.name).then(a.0.id.cmp(&b.0.id)));
        Ok(orgs)
    }

    async fn rename_organization(
        &self,
        org_id: Uuid,
        name: &str,
    ) -> Result<Organization, ServiceError> {
        let mut state = self.state()?;
        let org = state
            .organizations
            .get_mut(&org_id)
            .ok_or(ServiceError::NotFound("Organization"))?;
        org.name = name.to_string();
        org.updated_at = Utc::now();
        Ok(org.clone())
    }

    async fn delete_organization(&self, org_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.organizations.remove(&org_id).is_none() {
            return Err(ServiceError::NotFound("Organization"));
        }

        for user in state.users.values_mut() {
            if user.active_org_id == Some(org_id) {
                user.active_org_id = None;
            }
        }
        state.org_members.retain(|(oid, _), _| *oid != org_id);
        state.invitations.retain(|i| i.org_id != org_id);
        let project_ids: Vec<Uuid> = state
            .projects
            .values()
            .filter(|p| p.org_id == org_id)
            .map(|p| p.id)
            .collect();
        for project_id in project_ids {
            state.remove_project(project_id);
        }
        Ok(())
    }

    // ==================== Memberships ====================

    async fn find_membership(
        &self,
        user_id: Uuid,
        scope: Scope,
    ) -> Result<Option<Membership>, ServiceError> {
        Ok(self.state()?.membership(user_id, scope))
    }

    async fn list_members(&self, scope: Scope) -> Result<Vec<MemberDetail>, ServiceError> {
        let state = self.state()?;
        let mut members: Vec<MemberDetail> = state
            .members(scope.kind())
            .iter()
            .filter(|((scope_id, _), _)| *scope_id == scope.id())
            .filter_map(|((_, user_id), row)| {
                state.users.get(user_id).map(|user| MemberDetail {
                    user: user.summary(),
                    role: row.role,
                    joined_at: row.joined_at,
                })
            })
            .collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user.id.cmp(&b.user.id)));
        Ok(members)
    }

    async fn update_member_role(
        &self,
        scope: Scope,
        actor_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<RoleUpdate, ServiceError> {
        let mut state = self.state()?;
        let current = authorize_roster_change(
            &state.roster(scope),
            actor_id,
            user_id,
            MembershipChange::Role(role),
        )?;

        if let Some(row) = state.members_mut(scope.kind()).get_mut(&(scope.id(), user_id)) {
            row.role = role;
        }
        Ok(RoleUpdate {
            previous_role: current.role,
            membership: Membership { role, ..current },
        })
    }

    async fn remove_organization_member(
        &self,
        org_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        let mut state = self.state()?;
        let current = authorize_roster_change(
            &state.roster(Scope::Organization(org_id)),
            actor_id,
            user_id,
            MembershipChange::Removal,
        )?;

        let org_projects: Vec<Uuid> = state
            .projects
            .values()
            .filter(|p| p.org_id == org_id)
            .map(|p| p.id)
            .collect();
        let before = state.project_members.len();
        state
            .project_members
            .retain(|(pid, member), _| !(*member == user_id && org_projects.contains(pid)));
        let project_memberships_removed = (before - state.project_members.len()) as u64;

        state.org_members.remove(&(org_id, user_id));

        let mut active_org_cleared = false;
        if let Some(user) = state.users.get_mut(&user_id) {
            if user.active_org_id == Some(org_id) {
                user.active_org_id = None;
                active_org_cleared = true;
            }
        }

        Ok(RemovalOutcome {
            removed_role: Some(current.role),
            project_memberships_removed,
            active_org_cleared,
        })
    }

    async fn add_project_member(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> Result<Membership, ServiceError> {
        let mut state = self.state()?;
        let org_id = state
            .projects
            .get(&project_id)
            .map(|p| p.org_id)
            .ok_or(ServiceError::NotFound("Project"))?;
        if state
            .membership(user_id, Scope::Organization(org_id))
            .is_none()
        {
            return Err(ServiceError::NotOrgMember);
        }
        if state.project_members.contains_key(&(project_id, user_id)) {
            return Err(ServiceError::AlreadyMember(
                "User is already a member of this project".to_string(),
            ));
        }

        let joined_at = Utc::now();
        state
            .project_members
            .insert((project_id, user_id), MemberRow { role, joined_at });
        Ok(Membership {
            user_id,
            scope: Scope::Project(project_id),
            role,
            joined_at,
        })
    }

    async fn remove_project_member(
        &self,
        project_id: Uuid,
        actor_id: Uuid,
        user_id: Uuid,
    ) -> Result<RemovalOutcome, ServiceError> {
        let mut state = self.state()?;
        let current = authorize_roster_change(
            &state.roster(Scope::Project(project_id)),
            actor_id,
            user_id,
            MembershipChange::Removal,
        )?;

        state.project_members.remove(&(project_id, user_id));
        Ok(RemovalOutcome {
            removed_role: Some(current.role),
            ..RemovalOutcome::default()
        })
    }

    // ==================== Invitations ====================

    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state
            .invitations
            .iter()
            .any(|i| i.token_hash == invitation.token_hash)
        {
            return Err(ServiceError::DuplicateKey(
                "Invitation token collision".to_string(),
            ));
        }
        state.invitations.push(invitation.clone());
        Ok(())
    }

    async fn accept_invitation(
        &self,
        org_id: Uuid,
        token_hash: &str,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AcceptedInvitation, ServiceError> {
        let mut state = self.state()?;
        let scope = Scope::Organization(org_id);
        let already_member = state.membership(user_id, scope).is_some();

        let invitation = state
            .invitations
            .iter_mut()
            .find(|i| {
                i.org_id == org_id && i.token_hash == token_hash && i.is_redeemable_at(now)
            })
            .ok_or(ServiceError::NotFound("Invitation"))?;
        invitation.used_at = Some(now);
        let invitation = invitation.clone();

        if already_member {
            return Err(ServiceError::AlreadyMember(
                "You are already a member of this organization".to_string(),
            ));
        }

        state.org_members.insert(
            (org_id, user_id),
            MemberRow {
                role: invitation.role,
                joined_at: now,
            },
        );

        let mut active_org_set = false;
        if let Some(user) = state.users.get_mut(&user_id) {
            if user.active_org_id.is_none() {
                user.active_org_id = Some(org_id);
                active_org_set = true;
            }
        }

        Ok(AcceptedInvitation {
            membership: Membership {
                user_id,
                scope,
                role: invitation.role,
                joined_at: now,
            },
            invitation,
            active_org_set,
        })
    }

    // ==================== Projects ====================

    async fn create_project(&self, project: &Project, owner_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state
            .projects
            .values()
            .any(|p| p.org_id == project.org_id && p.slug == project.slug)
        {
            return Err(ServiceError::DuplicateKey(
                "A project with this slug already exists in the organization".to_string(),
            ));
        }
        state.projects.insert(project.id, project.clone());
        state.project_members.insert(
            (project.id, owner_id),
            MemberRow {
                role: Role::Owner,
                joined_at: project.created_at,
            },
        );
        Ok(())
    }

    async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>, ServiceError> {
        Ok(self.state()?.projects.get(&project_id).cloned())
    }

    async fn list_organization_projects(&self, org_id: Uuid) -> Result<Vec<Project>, ServiceError> {
        let state = self.state()?;
        let mut projects: Vec<Project> = state
            .projects
            .values()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(projects)
    }

    async fn list_user_projects(
        &self,
        user_id: Uuid,
        org_id: Option<Uuid>,
    ) -> Result<Vec<ProjectOverview>, ServiceError> {
        let state = self.state()?;
        let mut overviews: Vec<ProjectOverview> = state
            .projects
            .values()
            .filter(|p| org_id.map_or(true, |id| p.org_id == id))
            .filter_map(|project| {
                let org_role = state.org_members.get(&(project.org_id, user_id))?.role;
                Some(ProjectOverview {
                    project: project.clone(),
                    role: state
                        .project_members
                        .get(&(project.id, user_id))
                        .map(|row| row.role),
                    org_role,
                    member_count: state
                        .project_members
                        .keys()
                        .filter(|(pid, _)| *pid == project.id)
                        .count() as i64,
                    secret_count: state
                        .secrets
                        .values()
                        .filter(|s| s.project_id == project.id)
                        .count() as i64,
                })
            })
            .collect();
        overviews.sort_by(|a, b| {
            a.project
                .name
                .cmp(&b.project.name)
                .then(a.project.id.cmp(&b.project.id))
        });
        Ok(overviews)
    }

    async fn update_project(
        &self,
        project_id: Uuid,
        update: ProjectUpdate,
    ) -> Result<Project, ServiceError> {
        let mut state = self.state()?;
        let org_id = state
            .projects
            .get(&project_id)
            .map(|p| p.org_id)
            .ok_or(ServiceError::NotFound("Project"))?;
        if let Some(slug) = &update.slug {
            if state
                .projects
                .values()
                .any(|p| p.org_id == org_id && p.id != project_id && p.slug == *slug)
            {
                return Err(ServiceError::DuplicateKey(
                    "A project with this slug already exists in the organization".to_string(),
                ));
            }
        }

        let project = state
            .projects
            .get_mut(&project_id)
            .ok_or(ServiceError::NotFound("Project"))?;
        if let Some(name) = update.name {
            project.name = name;
        }
        if let Some(slug) = update.slug {
            project.slug = slug;
        }
        if let Some(description) = update.description {
            project.description = description;
        }
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if !state.projects.contains_key(&project_id) {
            return Err(ServiceError::NotFound("Project"));
        }
        state.remove_project(project_id);
        Ok(())
    }

    // ==================== Secrets ====================

    async fn create_secret(
        &self,
        secret: &Secret,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        let mut state = self.state()?;
        if !state.projects.contains_key(&secret.project_id) {
            return Err(ServiceError::NotFound("Project"));
        }
        if state
            .secrets
            .values()
            .any(|s| s.project_id == secret.project_id && s.key == secret.key)
        {
            return Err(ServiceError::DuplicateKey(format!(
                "Secret '{}' already exists in this project",
                secret.key
            )));
        }

        let values = values
            .into_iter()
            .map(|v| v.into_value(secret.id, secret.created_at))
            .collect();
        state.secrets.insert(secret.id, secret.clone());
        state.secret_values.insert(secret.id, values);
        Ok(state.with_values(secret))
    }

    async fn find_secret(&self, secret_id: Uuid) -> Result<Option<SecretWithValues>, ServiceError> {
        let state = self.state()?;
        Ok(state.secrets.get(&secret_id).map(|s| state.with_values(s)))
    }

    async fn find_secret_by_key(
        &self,
        project_id: Uuid,
        key: &str,
    ) -> Result<Option<SecretWithValues>, ServiceError> {
        let state = self.state()?;
        Ok(state
            .secrets
            .values()
            .find(|s| s.project_id == project_id && s.key == key)
            .map(|s| state.with_values(s)))
    }

    async fn list_secrets(&self, project_id: Uuid) -> Result<Vec<SecretWithValues>, ServiceError> {
        let state = self.state()?;
        let mut secrets: Vec<SecretWithValues> = state
            .secrets
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| state.with_values(s))
            .collect();
        secrets.sort_by(|a, b| a.secret.key.cmp(&b.secret.key));
        Ok(secrets)
    }

    async fn replace_secret_values(
        &self,
        secret_id: Uuid,
        description: Option<Option<String>>,
        values: Vec<NewSecretValue>,
    ) -> Result<SecretWithValues, ServiceError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let secret = state
            .secrets
            .get_mut(&secret_id)
            .ok_or(ServiceError::NotFound("Secret"))?;
        if let Some(description) = description {
            secret.description = description;
        }
        secret.updated_at = now;
        let secret = secret.clone();

        let values = values
            .into_iter()
            .map(|v| v.into_value(secret_id, now))
            .collect();
        state.secret_values.insert(secret_id, values);
        Ok(state.with_values(&secret))
    }

    async fn delete_secret(&self, secret_id: Uuid) -> Result<(), ServiceError> {
        let mut state = self.state()?;
        if state.secrets.remove(&secret_id).is_none() {
            return Err(ServiceError::NotFound("Secret"));
        }
        state.secret_values.remove(&secret_id);
        Ok(())
    }

    // ==================== Audit logs ====================

    async fn insert_audit_log(&self, log: &AuditLog) -> Result<(), ServiceError> {
        self.state()?.audit_logs.push(log.clone());
        Ok(())
    }

    async fn find_audit_logs(
        &self,
        org_id: Uuid,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<AuditLog>, i64), ServiceError> {
        let state = self.state()?;
        // Newest insert first among equal timestamps.
        let mut matching: Vec<&AuditLog> = state
            .audit_logs
            .iter()
            .rev()
            .filter(|log| log.org_id == org_id && matches_audit_filter(log, filter))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn purge_audit_logs(
        &self,
        org_id: Uuid,
        filter: &PurgeFilter,
        protected_actions: &[String],
    ) -> Result<u64, ServiceError> {
        let mut state = self.state()?;
        let before = state.audit_logs.len();
        state.audit_logs.retain(|log| {
            !(log.org_id == org_id
                && matches_purge_filter(log, filter)
                && !log.is_protected(protected_actions))
        });
        Ok((before - state.audit_logs.len()) as u64)
    }

    async fn audit_filter_options(&self, org_id: Uuid) -> Result<AuditFilterOptions, ServiceError> {
        let state = self.state()?;
        let mut actions = BTreeSet::new();
        let mut resources = BTreeSet::new();
        let mut user_ids = BTreeSet::new();
        for log in state.audit_logs.iter().filter(|l| l.org_id == org_id) {
            actions.insert(log.action.clone());
            resources.insert(log.resource.clone());
            if let Some(user_id) = log.user_id {
                user_ids.insert(user_id);
            }
        }

        let mut users: Vec<_> = user_ids
            .into_iter()
            .filter_map(|id| state.users.get(&id).map(User::summary))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.email.cmp(&b.email)));

        Ok(AuditFilterOptions {
            actions: actions.into_iter().collect(),
            resources: resources.into_iter().collect(),
            users,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn user(store: &MemoryStore, email: &str) -> User {
        store
            .upsert_user(&ExternalProfile {
                email: email.to_string(),
                name: None,
                image: None,
            })
            .await
            .unwrap()
    }

    async fn org_with_owner(store: &MemoryStore, owner: &User) -> Uuid {
        let org = Organization::new("Acme".to_string());
        store.create_organization(&org, owner.id).await.unwrap();
        org.id
    }

    async fn join(store: &MemoryStore, org_id: Uuid, inviter: &User, invitee: &User, role: Role) {
        let hash = format!("hash-{}", invitee.id);
        let invitation = Invitation::new(
            org_id,
            invitee.email.clone(),
            role,
            hash.clone(),
            inviter.id,
            Utc::now() + Duration::hours(1),
        );
        store.insert_invitation(&invitation).await.unwrap();
        store
            .accept_invitation(org_id, &hash, invitee.id, Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn role_change_is_authorized_against_current_roles() {
        let store = MemoryStore::new();
        let alice = user(&store, "alice@example.com").await;
        let bob = user(&store, "bob@example.com").await;
        let carol = user(&store, "carol@example.com").await;
        let org_id = org_with_owner(&store, &alice).await;
        let scope = Scope::Organization(org_id);
        join(&store, org_id, &alice, &bob, Role::Admin).await;
        join(&store, org_id, &alice, &carol, Role::Member).await;

        // Carol becomes an owner after Bob's request passed its first check
        let promoted = store
            .update_member_role(scope, alice.id, carol.id, Role::Owner)
            .await
            .unwrap();
        assert_eq!(promoted.previous_role, Role::Member);

        let demote = store
            .update_member_role(scope, bob.id, carol.id, Role::Member)
            .await;
        let remove = store.remove_organization_member(org_id, bob.id, carol.id).await;

        assert!(matches!(demote, Err(ServiceError::InsufficientRole)));
        assert!(matches!(remove, Err(ServiceError::InsufficientRole)));
        assert_eq!(
            store.find_membership(carol.id, scope).await.unwrap().unwrap().role,
            Role::Owner
        );
    }

    #[tokio::test]
    async fn last_owner_survives_and_second_owner_can_hand_over() {
        let store = MemoryStore::new();
        let alice = user(&store, "alice@example.com").await;
        let bob = user(&store, "bob@example.com").await;
        let org_id = org_with_owner(&store, &alice).await;
        let scope = Scope::Organization(org_id);
        join(&store, org_id, &alice, &bob, Role::Owner).await;

        let handed_over = store
            .update_member_role(scope, bob.id, alice.id, Role::Admin)
            .await
            .unwrap();
        assert_eq!(handed_over.previous_role, Role::Owner);
        assert_eq!(handed_over.membership.role, Role::Admin);

        // Bob is now the only owner; Alice, as admin, cannot touch him
        let result = store
            .update_member_role(scope, alice.id, bob.id, Role::Member)
            .await;
        assert!(matches!(result, Err(ServiceError::InsufficientRole)));
        assert_eq!(store.state().unwrap().other_owners(scope, alice.id), 1);
    }

    #[tokio::test]
    async fn removal_cascades_to_projects_and_active_org() {
        let store = MemoryStore::new();
        let alice = user(&store, "alice@example.com").await;
        let bob = user(&store, "bob@example.com").await;
        let org_id = org_with_owner(&store, &alice).await;
        join(&store, org_id, &alice, &bob, Role::Member).await;
        let project = Project::new(org_id, "Backend".to_string(), "backend".to_string(), None);
        store.create_project(&project, alice.id).await.unwrap();
        store
            .add_project_member(project.id, bob.id, Role::Member)
            .await
            .unwrap();

        let outcome = store
            .remove_organization_member(org_id, alice.id, bob.id)
            .await
            .unwrap();

        assert_eq!(outcome.removed_role, Some(Role::Member));
        assert_eq!(outcome.project_memberships_removed, 1);
        assert!(outcome.active_org_cleared);
        assert!(store
            .find_membership(bob.id, Scope::Project(project.id))
            .await
            .unwrap()
            .is_none());
        assert!(store.find_user(bob.id).await.unwrap().unwrap().active_org_id.is_none());
    }

    #[tokio::test]
    async fn invitation_is_consumed_even_for_existing_members() {
        let store = MemoryStore::new();
        let alice = user(&store, "alice@example.com").await;
        let carol = user(&store, "carol@example.com").await;
        let org_id = org_with_owner(&store, &alice).await;
        let invitation = Invitation::new(
            org_id,
            "dave@example.com".to_string(),
            Role::Member,
            "dave-hash".to_string(),
            alice.id,
            Utc::now() + Duration::hours(1),
        );
        store.insert_invitation(&invitation).await.unwrap();

        let by_owner = store
            .accept_invitation(org_id, "dave-hash", alice.id, Utc::now())
            .await;
        let by_carol = store
            .accept_invitation(org_id, "dave-hash", carol.id, Utc::now())
            .await;

        assert!(matches!(by_owner, Err(ServiceError::AlreadyMember(_))));
        assert!(matches!(by_carol, Err(ServiceError::NotFound(_))));
    }
}
