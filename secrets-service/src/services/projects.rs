//! Projects and their rosters. Project roles are independent of organization
//! roles, but every project member must also belong to the organization.

use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::access::{AccessControl, ANY_MEMBER, ELEVATED, OWNER_ONLY};
use super::audit::AuditTrail;
use super::identity::{Actor, CallerIdentity};
use super::store::{ProjectUpdate, Store};
use super::ServiceError;
use crate::dtos::project::{
    AddProjectMemberRequest, CreateProjectRequest, ListProjectsQuery, ProjectDetail,
    UpdateProjectRequest,
};
use crate::dtos::{MembershipResponse, RemovalResponse, RoleChangeRequest};
use crate::models::{
    AuditAction, AuditResource, MemberDetail, Project, ProjectOverview, Role, Scope,
};
use crate::utils::slug::{is_valid_slug, normalize_slug};
use crate::utils::validation::{non_blank, trimmed};

/// Stored slug: the supplied one if any, else derived from the name.
fn resolve_slug(supplied: Option<&str>, name: &str) -> Result<String, ServiceError> {
    let slug = match supplied.map(str::trim).filter(|s| !s.is_empty()) {
        Some(slug) => {
            if !is_valid_slug(slug) {
                return Err(ServiceError::Validation(
                    "Slug may only contain lowercase letters, digits and hyphens".to_string(),
                ));
            }
            normalize_slug(slug)
        }
        None => normalize_slug(name),
    };
    if slug.is_empty() {
        return Err(ServiceError::Validation(
            "Slug must contain at least one letter or digit".to_string(),
        ));
    }
    Ok(slug)
}

#[derive(Clone)]
pub struct ProjectService {
    store: Arc<dyn Store>,
    access: AccessControl,
    audit: AuditTrail,
}

impl ProjectService {
    pub fn new(store: Arc<dyn Store>, access: AccessControl, audit: AuditTrail) -> Self {
        Self {
            store,
            access,
            audit,
        }
    }

    async fn load(&self, project_id: Uuid) -> Result<Project, ServiceError> {
        self.store
            .find_project(project_id)
            .await?
            .ok_or(ServiceError::NotFound("Project"))
    }

    /// Org owner/admin. Defaults to the caller's active organization; the
    /// creator becomes the project's owner.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn create(
        &self,
        actor: &Actor,
        req: CreateProjectRequest,
    ) -> Result<Project, ServiceError> {
        let org_id = req
            .org_id
            .or(actor.identity.active_org_id)
            .ok_or_else(|| {
                ServiceError::Validation(
                    "orgId is required when no active organization is set".to_string(),
                )
            })?;
        self.access
            .require_role(actor.user_id(), Scope::Organization(org_id), ELEVATED)
            .await?;

        let name = trimmed("Name", &req.name, 2, 100)?;
        let slug = resolve_slug(req.slug.as_deref(), &name)?;
        let project = Project::new(org_id, name, slug, non_blank(req.description));

        self.store.create_project(&project, actor.user_id()).await?;
        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Create,
                AuditResource::Project,
                json!({
                    "projectId": project.id,
                    "name": project.name,
                    "slug": project.slug,
                }),
            )
            .await?;

        tracing::info!(project_id = %project.id, org_id = %org_id, "Project created");
        Ok(project)
    }

    /// Projects across the caller's organizations, or one organization's.
    pub async fn list(
        &self,
        caller: &CallerIdentity,
        query: ListProjectsQuery,
    ) -> Result<Vec<ProjectOverview>, ServiceError> {
        if let Some(org_id) = query.org_id {
            self.access
                .require_role(caller.user_id, Scope::Organization(org_id), ANY_MEMBER)
                .await?;
        }
        self.store
            .list_user_projects(caller.user_id, query.org_id)
            .await
    }

    pub async fn get(
        &self,
        caller: &CallerIdentity,
        project_id: Uuid,
    ) -> Result<ProjectDetail, ServiceError> {
        let membership = self
            .access
            .require_role(caller.user_id, Scope::Project(project_id), ANY_MEMBER)
            .await?;
        let project = self.load(project_id).await?;
        let members = self.store.list_members(Scope::Project(project_id)).await?;

        Ok(ProjectDetail {
            project,
            role: membership.role,
            members,
        })
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update(
        &self,
        actor: &Actor,
        project_id: Uuid,
        req: UpdateProjectRequest,
    ) -> Result<Project, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        let previous = self.load(project_id).await?;

        let name = req
            .name
            .as_deref()
            .map(|n| trimmed("Name", n, 2, 100))
            .transpose()?;
        let slug = match req.slug.as_deref() {
            Some(slug) => Some(resolve_slug(Some(slug), &previous.name)?),
            None => None,
        };
        let description = req.description.map(|d| non_blank(Some(d)));
        if name.is_none() && slug.is_none() && description.is_none() {
            return Err(ServiceError::Validation("No changes supplied".to_string()));
        }

        let project = self
            .store
            .update_project(
                project_id,
                ProjectUpdate {
                    name,
                    slug,
                    description,
                },
            )
            .await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Update,
                AuditResource::Project,
                json!({
                    "projectId": project.id,
                    "previous": {
                        "name": previous.name,
                        "slug": previous.slug,
                        "description": previous.description,
                    },
                    "name": project.name,
                    "slug": project.slug,
                    "description": project.description,
                }),
            )
            .await?;

        Ok(project)
    }

    /// Project owner only. Secrets and memberships are deleted with it.
    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn delete(&self, actor: &Actor, project_id: Uuid) -> Result<(), ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), OWNER_ONLY)
            .await?;
        let project = self.load(project_id).await?;
        let keys: Vec<String> = self
            .store
            .list_secrets(project_id)
            .await?
            .into_iter()
            .map(|s| s.secret.key)
            .collect();

        self.store.delete_project(project_id).await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Delete,
                AuditResource::Project,
                json!({
                    "projectId": project.id,
                    "name": project.name,
                    "deletedKeys": keys,
                }),
            )
            .await?;

        tracing::info!(project_id = %project_id, "Project deleted");
        Ok(())
    }

    // ==================== Members ====================

    pub async fn list_members(
        &self,
        caller: &CallerIdentity,
        project_id: Uuid,
    ) -> Result<Vec<MemberDetail>, ServiceError> {
        self.access
            .require_role(caller.user_id, Scope::Project(project_id), ANY_MEMBER)
            .await?;
        self.store.list_members(Scope::Project(project_id)).await
    }

    /// Project owner/admin. The target is found by email and must already
    /// belong to the project's organization.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn add_member(
        &self,
        actor: &Actor,
        project_id: Uuid,
        req: AddProjectMemberRequest,
    ) -> Result<MembershipResponse, ServiceError> {
        let acting = self
            .access
            .require_role(actor.user_id(), Scope::Project(project_id), ELEVATED)
            .await?;
        if req.role == Role::Owner && acting.role != Role::Owner {
            return Err(ServiceError::InsufficientRole);
        }
        let project = self.load(project_id).await?;
        let user = self
            .store
            .find_user_by_email(req.email.trim())
            .await?
            .ok_or(ServiceError::NotFound("User"))?;

        let membership = self
            .store
            .add_project_member(project_id, user.id, req.role)
            .await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Create,
                AuditResource::ProjectMembership,
                json!({
                    "projectId": project_id,
                    "userId": user.id,
                    "email": user.email,
                    "role": membership.role,
                }),
            )
            .await?;

        Ok(MembershipResponse::from(membership))
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update_member_role(
        &self,
        actor: &Actor,
        project_id: Uuid,
        target_user: Uuid,
        req: RoleChangeRequest,
    ) -> Result<MembershipResponse, ServiceError> {
        let scope = Scope::Project(project_id);
        self.access
            .require_role(actor.user_id(), scope, ANY_MEMBER)
            .await?;
        let project = self.load(project_id).await?;

        let updated = self
            .store
            .update_member_role(scope, actor.user_id(), target_user, req.role)
            .await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Update,
                AuditResource::ProjectMembership,
                json!({
                    "projectId": project_id,
                    "userId": target_user,
                    "previousRole": updated.previous_role,
                    "role": updated.membership.role,
                }),
            )
            .await?;

        Ok(MembershipResponse::from(updated.membership))
    }

    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn remove_member(
        &self,
        actor: &Actor,
        project_id: Uuid,
        target_user: Uuid,
    ) -> Result<RemovalResponse, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Project(project_id), ANY_MEMBER)
            .await?;
        let project = self.load(project_id).await?;

        let outcome = self
            .store
            .remove_project_member(project_id, actor.user_id(), target_user)
            .await?;
        self.audit
            .record(
                actor,
                project.org_id,
                AuditAction::Delete,
                AuditResource::ProjectMembership,
                json!({
                    "projectId": project_id,
                    "userId": target_user,
                    "role": outcome.removed_role,
                    "selfRemoval": target_user == actor.user_id(),
                }),
            )
            .await?;

        Ok(RemovalResponse::new(target_user, &outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_defaults_to_normalized_name() {
        assert_eq!(resolve_slug(None, "My Web App").unwrap(), "my-web-app");
        assert_eq!(resolve_slug(Some("  "), "API").unwrap(), "api");
    }

    #[test]
    fn supplied_slug_must_use_allowed_characters() {
        assert_eq!(resolve_slug(Some("web-2"), "ignored").unwrap(), "web-2");
        assert_eq!(resolve_slug(Some("-web--"), "ignored").unwrap(), "web");
        assert!(matches!(
            resolve_slug(Some("Web App"), "ignored"),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            resolve_slug(None, "!!"),
            Err(ServiceError::Validation(_))
        ));
    }
}
