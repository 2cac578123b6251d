//! Organization lifecycle, invitations and the organization roster.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use super::access::{AccessControl, ANY_MEMBER, ELEVATED, OWNER_ONLY};
use super::audit::AuditTrail;
use super::identity::{hash_token, Actor, CallerIdentity};
use super::store::Store;
use super::ServiceError;
use crate::dtos::organization::{
    AcceptInvitationRequest, AcceptInvitationResponse, CreateOrganizationRequest, InviteRequest,
    InviteResponse, OrganizationDetail, OrganizationResponse, UpdateOrganizationRequest,
};
use crate::dtos::{MembershipResponse, RemovalResponse, RoleChangeRequest};
use crate::models::{AuditAction, AuditResource, Invitation, Organization, Role, Scope};
use crate::utils::validation::{parse_uuid, trimmed};

#[derive(Clone)]
pub struct OrganizationService {
    store: Arc<dyn Store>,
    access: AccessControl,
    audit: AuditTrail,
    invitation_ttl: Duration,
}

impl OrganizationService {
    pub fn new(
        store: Arc<dyn Store>,
        access: AccessControl,
        audit: AuditTrail,
        invitation_ttl: Duration,
    ) -> Self {
        Self {
            store,
            access,
            audit,
            invitation_ttl,
        }
    }

    async fn load(&self, org_id: Uuid) -> Result<Organization, ServiceError> {
        self.store
            .find_organization(org_id)
            .await?
            .ok_or(ServiceError::NotFound("Organization"))
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn create(
        &self,
        actor: &Actor,
        req: CreateOrganizationRequest,
    ) -> Result<OrganizationResponse, ServiceError> {
        let name = trimmed("Name", &req.name, 2, 100)?;
        let org = Organization::new(name);

        self.store.create_organization(&org, actor.user_id()).await?;
        self.audit
            .record(
                actor,
                org.id,
                AuditAction::Create,
                AuditResource::Organization,
                json!({ "name": org.name }),
            )
            .await?;

        tracing::info!(org_id = %org.id, "Organization created");
        Ok(OrganizationResponse::new(org, Role::Owner))
    }

    pub async fn list(
        &self,
        caller: &CallerIdentity,
    ) -> Result<Vec<OrganizationResponse>, ServiceError> {
        let orgs = self.store.list_user_organizations(caller.user_id).await?;
        Ok(orgs
            .into_iter()
            .map(|(org, role)| OrganizationResponse::new(org, role))
            .collect())
    }

    pub async fn get(
        &self,
        caller: &CallerIdentity,
        org_id: Uuid,
    ) -> Result<OrganizationDetail, ServiceError> {
        let membership = self
            .access
            .require_role(caller.user_id, Scope::Organization(org_id), ANY_MEMBER)
            .await?;
        let org = self.load(org_id).await?;
        let members = self.store.list_members(Scope::Organization(org_id)).await?;
        let projects = self.store.list_organization_projects(org_id).await?;

        Ok(OrganizationDetail {
            organization: OrganizationResponse::new(org, membership.role),
            members,
            projects,
        })
    }

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update(
        &self,
        actor: &Actor,
        org_id: Uuid,
        req: UpdateOrganizationRequest,
    ) -> Result<OrganizationResponse, ServiceError> {
        let membership = self
            .access
            .require_role(actor.user_id(), Scope::Organization(org_id), ELEVATED)
            .await?;
        let name = trimmed("Name", &req.name, 2, 100)?;
        let previous = self.load(org_id).await?;

        let org = self.store.rename_organization(org_id, &name).await?;
        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Update,
                AuditResource::Organization,
                json!({ "name": org.name, "previousName": previous.name }),
            )
            .await?;

        Ok(OrganizationResponse::new(org, membership.role))
    }

    /// Owner only. Active-org pointers are cleared and projects, secrets,
    /// memberships and invitations go with it. Audit history is kept.
    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn delete(&self, actor: &Actor, org_id: Uuid) -> Result<(), ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Organization(org_id), OWNER_ONLY)
            .await?;
        let org = self.load(org_id).await?;
        let members = self.store.list_members(Scope::Organization(org_id)).await?;
        let projects = self.store.list_organization_projects(org_id).await?;

        self.store.delete_organization(org_id).await?;
        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Delete,
                AuditResource::Organization,
                json!({
                    "name": org.name,
                    "memberCount": members.len(),
                    "projectCount": projects.len(),
                }),
            )
            .await?;

        tracing::info!(org_id = %org_id, "Organization deleted");
        Ok(())
    }

    // ==================== Invitations ====================

    /// Owner/admin. Only an owner may invite another owner.
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn invite(
        &self,
        actor: &Actor,
        org_id: Uuid,
        req: InviteRequest,
    ) -> Result<InviteResponse, ServiceError> {
        let membership = self
            .access
            .require_role(actor.user_id(), Scope::Organization(org_id), ELEVATED)
            .await?;
        if req.role == Role::Owner && membership.role != Role::Owner {
            return Err(ServiceError::InsufficientRole);
        }

        let email = req.email.trim().to_lowercase();
        if let Some(user) = self.store.find_user_by_email(&email).await? {
            if self
                .store
                .find_membership(user.id, Scope::Organization(org_id))
                .await?
                .is_some()
            {
                return Err(ServiceError::AlreadyMember(
                    "User is already a member of this organization".to_string(),
                ));
            }
        }

        let token = Uuid::new_v4().to_string();
        let invitation = Invitation::new(
            org_id,
            email,
            req.role,
            hash_token(&token),
            actor.user_id(),
            Utc::now() + self.invitation_ttl,
        );
        self.store.insert_invitation(&invitation).await?;

        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Create,
                AuditResource::Invitation,
                json!({
                    "invitationId": invitation.id,
                    "email": invitation.email,
                    "role": invitation.role,
                    "expiresAt": invitation.expires_at,
                }),
            )
            .await?;

        Ok(InviteResponse {
            token,
            email: invitation.email,
            role: invitation.role,
            expires_at: invitation.expires_at,
        })
    }

    /// Redeem an invitation for the calling user. Missing, used and expired
    /// tokens are indistinguishable (`NotFound`).
    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn accept_invitation(
        &self,
        actor: &Actor,
        org_id: Uuid,
        req: AcceptInvitationRequest,
    ) -> Result<AcceptInvitationResponse, ServiceError> {
        let token = parse_uuid("token", &req.token)?;
        let accepted = self
            .store
            .accept_invitation(
                org_id,
                &hash_token(&token.to_string()),
                actor.user_id(),
                Utc::now(),
            )
            .await?;

        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Accept,
                AuditResource::Invitation,
                json!({
                    "invitationId": accepted.invitation.id,
                    "email": accepted.invitation.email,
                    "role": accepted.membership.role,
                }),
            )
            .await?;

        tracing::info!(org_id = %org_id, "Invitation accepted");
        Ok(AcceptInvitationResponse {
            org_id,
            role: accepted.membership.role,
            active_org_set: accepted.active_org_set,
        })
    }

    // ==================== Members ====================

    #[tracing::instrument(skip(self, actor, req), fields(user_id = %actor.user_id()))]
    pub async fn update_member_role(
        &self,
        actor: &Actor,
        org_id: Uuid,
        target_user: Uuid,
        req: RoleChangeRequest,
    ) -> Result<MembershipResponse, ServiceError> {
        let scope = Scope::Organization(org_id);
        self.access
            .require_role(actor.user_id(), scope, ANY_MEMBER)
            .await?;

        let updated = self
            .store
            .update_member_role(scope, actor.user_id(), target_user, req.role)
            .await?;
        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Update,
                AuditResource::OrganizationMembership,
                json!({
                    "userId": target_user,
                    "previousRole": updated.previous_role,
                    "role": updated.membership.role,
                }),
            )
            .await?;

        Ok(MembershipResponse::from(updated.membership))
    }

    /// Remove a member together with their project memberships in this
    /// organization. Non-owners may remove themselves.
    #[tracing::instrument(skip(self, actor), fields(user_id = %actor.user_id()))]
    pub async fn remove_member(
        &self,
        actor: &Actor,
        org_id: Uuid,
        target_user: Uuid,
    ) -> Result<RemovalResponse, ServiceError> {
        self.access
            .require_role(actor.user_id(), Scope::Organization(org_id), ANY_MEMBER)
            .await?;

        let outcome = self
            .store
            .remove_organization_member(org_id, actor.user_id(), target_user)
            .await?;
        self.audit
            .record(
                actor,
                org_id,
                AuditAction::Delete,
                AuditResource::OrganizationMembership,
                json!({
                    "userId": target_user,
                    "role": outcome.removed_role,
                    "selfRemoval": target_user == actor.user_id(),
                    "projectMembershipsRemoved": outcome.project_memberships_removed,
                }),
            )
            .await?;

        Ok(RemovalResponse::new(target_user, &outcome))
    }
}
