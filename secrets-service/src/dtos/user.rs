use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::organization::OrganizationResponse;
use crate::models::{Project, User};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: User,
    pub organizations: Vec<OrganizationResponse>,
    pub active_organization: Option<ActiveOrganization>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveOrganization {
    #[serde(flatten)]
    pub organization: OrganizationResponse,
    pub projects: Vec<Project>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMeRequest {
    #[validate(length(min = 2, max = 100, message = "Name must be 2-100 characters"))]
    pub name: Option<String>,

    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,

    pub active_org_id: Option<Uuid>,
}

/// The raw token is shown exactly once.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTokenResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
