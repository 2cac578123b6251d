//! Request and response shapes. JSON field names are camelCase throughout.

pub mod audit;
pub mod organization;
pub mod project;
pub mod secret;
pub mod user;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{Membership, Role};
use crate::services::store::RemovalOutcome;

/// Body of `PUT .../members/:user_id` for both scopes.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangeRequest {
    pub role: Role,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipResponse {
    pub user_id: Uuid,
    pub scope_id: Uuid,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

impl From<Membership> for MembershipResponse {
    fn from(m: Membership) -> Self {
        Self {
            user_id: m.user_id,
            scope_id: m.scope.id(),
            role: m.role,
            joined_at: m.joined_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalResponse {
    pub user_id: Uuid,
    pub project_memberships_removed: u64,
    pub active_org_cleared: bool,
}

impl RemovalResponse {
    pub fn new(user_id: Uuid, outcome: &RemovalOutcome) -> Self {
        Self {
            user_id,
            project_memberships_removed: outcome.project_memberships_removed,
            active_org_cleared: outcome.active_org_cleared,
        }
    }
}
