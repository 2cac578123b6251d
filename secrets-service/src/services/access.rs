//! Role lookup and enforcement for organization and project scopes.

use std::sync::Arc;
use uuid::Uuid;

use super::metrics::Metrics;
use super::store::Store;
use super::ServiceError;
use crate::models::{Membership, Role, Scope, ScopeKind};

pub const OWNER_ONLY: &[Role] = &[Role::Owner];
pub const ELEVATED: &[Role] = &[Role::Owner, Role::Admin];
pub const ANY_MEMBER: &[Role] = &[Role::Owner, Role::Admin, Role::Member];

#[derive(Clone)]
pub struct AccessControl {
    store: Arc<dyn Store>,
    metrics: Metrics,
}

impl AccessControl {
    pub fn new(store: Arc<dyn Store>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// The caller's membership in `scope`, provided its role is in `allowed`.
    pub async fn require_role(
        &self,
        user_id: Uuid,
        scope: Scope,
        allowed: &[Role],
    ) -> Result<Membership, ServiceError> {
        let membership = self.store.find_membership(user_id, scope).await?;
        check_role(membership, scope.kind(), allowed).inspect_err(|e| {
            tracing::info!(
                user_id = %user_id,
                scope = %scope.kind(),
                scope_id = %scope.id(),
                reason = e.kind(),
                "Access denied"
            );
            self.metrics.record_denied(scope.kind(), e.kind());
        })
    }
}

pub fn check_role(
    membership: Option<Membership>,
    kind: ScopeKind,
    allowed: &[Role],
) -> Result<Membership, ServiceError> {
    let membership = membership.ok_or(ServiceError::NotAMember(kind))?;
    if !allowed.contains(&membership.role) {
        return Err(ServiceError::InsufficientRole);
    }
    Ok(membership)
}

/// A pending change to somebody's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Role(Role),
    Removal,
}

/// Refuses to leave a scope without an owner. `other_owners` counts owners
/// other than the target.
pub fn ensure_owner_remains(
    kind: ScopeKind,
    current: Role,
    change: MembershipChange,
    other_owners: usize,
) -> Result<(), ServiceError> {
    let stays_owner = change == MembershipChange::Role(Role::Owner);
    if current == Role::Owner && !stays_owner && other_owners == 0 {
        return Err(ServiceError::LastOwnerViolation(kind));
    }
    Ok(())
}

/// Who may change whose membership.
///
/// Nobody changes their own role. Anyone but an owner may leave on their own.
/// Changing somebody else needs admin, and touching an owner (or granting
/// ownership) needs owner.
pub fn guard_membership_change(
    actor: &Membership,
    target_user: Uuid,
    target_role: Role,
    change: MembershipChange,
) -> Result<(), ServiceError> {
    if actor.user_id == target_user {
        return match change {
            MembershipChange::Role(_) => Err(ServiceError::SelfModificationForbidden(
                "You cannot change your own role".to_string(),
            )),
            MembershipChange::Removal if actor.role == Role::Owner => {
                Err(ServiceError::SelfModificationForbidden(format!(
                    "Owners cannot remove themselves from a {}; transfer ownership first",
                    actor.scope.kind()
                )))
            }
            MembershipChange::Removal => Ok(()),
        };
    }

    if !actor.role.is_elevated() {
        return Err(ServiceError::InsufficientRole);
    }

    let touches_owner =
        target_role == Role::Owner || change == MembershipChange::Role(Role::Owner);
    if touches_owner && actor.role != Role::Owner {
        return Err(ServiceError::InsufficientRole);
    }

    Ok(())
}

/// Applies [`guard_membership_change`] and [`ensure_owner_remains`] to a
/// roster read under the store's lock, so both rules see the committed roles
/// of actor and target. Returns the target's current membership.
pub fn authorize_roster_change(
    roster: &[Membership],
    actor_id: Uuid,
    target_user: Uuid,
    change: MembershipChange,
) -> Result<Membership, ServiceError> {
    let target = roster
        .iter()
        .find(|m| m.user_id == target_user)
        .cloned()
        .ok_or(ServiceError::NotFound("Membership"))?;
    let kind = target.scope.kind();
    let acting = roster
        .iter()
        .find(|m| m.user_id == actor_id)
        .ok_or(ServiceError::NotAMember(kind))?;

    guard_membership_change(acting, target_user, target.role, change)?;

    let other_owners = roster
        .iter()
        .filter(|m| m.user_id != target_user && m.role == Role::Owner)
        .count();
    ensure_owner_remains(kind, target.role, change, other_owners)?;

    Ok(target)
}
