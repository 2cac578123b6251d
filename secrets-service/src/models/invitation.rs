//! Invitation model - single-use tokens granting organization membership.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Role;

/// Invitation entity. Only the SHA-256 of the token is stored.
#[derive(Debug, Clone, FromRow)]
pub struct Invitation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: String,
    pub role: Role,
    pub token_hash: String,
    pub invited_by: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    pub fn new(
        org_id: Uuid,
        email: String,
        role: Role,
        token_hash: String,
        invited_by: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            email,
            role,
            token_hash,
            invited_by: Some(invited_by),
            expires_at,
            used_at: None,
            created_at: Utc::now(),
        }
    }

    /// Unused and not yet expired.
    pub fn is_redeemable_at(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && now < self.expires_at
    }
}
