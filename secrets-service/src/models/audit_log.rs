//! Audit log model - append-only record of every mutating action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Audit verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Accept,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Accept => "accept",
        }
    }
}

/// Audit nouns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResource {
    Organization,
    OrganizationMembership,
    Invitation,
    Project,
    ProjectMembership,
    Secret,
    AuditLogs,
    User,
}

impl AuditResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResource::Organization => "organization",
            AuditResource::OrganizationMembership => "organization_membership",
            AuditResource::Invitation => "invitation",
            AuditResource::Project => "project",
            AuditResource::ProjectMembership => "project_membership",
            AuditResource::Secret => "secret",
            AuditResource::AuditLogs => "audit_logs",
            AuditResource::User => "user",
        }
    }
}

/// Audit log entity. Rows are never updated, only created or purged.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub org_id: Uuid,
    pub action: String,
    pub resource: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn new(
        user_id: Uuid,
        org_id: Uuid,
        action: AuditAction,
        resource: AuditResource,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            org_id,
            action: action.as_str().to_string(),
            resource: resource.as_str().to_string(),
            metadata,
            created_at: Utc::now(),
        }
    }

    /// `resource.action`, e.g. `organization.create`.
    pub fn qualified_action(&self) -> String {
        format!("{}.{}", self.resource, self.action)
    }

    /// Whether a purge must leave this row in place.
    pub fn is_protected(&self, protected_actions: &[String]) -> bool {
        let qualified = self.qualified_action();
        protected_actions
            .iter()
            .any(|p| *p == qualified || *p == self.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn protection_matches_qualified_or_bare_action() {
        let log = AuditLog::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            AuditAction::Create,
            AuditResource::Organization,
            json!({}),
        );

        assert_eq!(log.qualified_action(), "organization.create");
        assert!(log.is_protected(&["organization.create".to_string()]));
        assert!(log.is_protected(&["create".to_string()]));
        assert!(!log.is_protected(&["project.create".to_string()]));
        assert!(!log.is_protected(&[]));
    }
}
