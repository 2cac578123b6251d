//! Caller identity resolution: session cookie first, CLI bearer token second.

use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use service_core::middleware::client_info::ClientInfo;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use super::store::Store;
use super::ServiceError;
use crate::models::{ExternalProfile, Session, User};

/// The authenticated caller, re-read from storage on every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub active_org_id: Option<Uuid>,
}

impl From<&User> for CallerIdentity {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            active_org_id: user.active_org_id,
        }
    }
}

/// Caller plus the request details recorded with every audit entry.
#[derive(Debug, Clone)]
pub struct Actor {
    pub identity: CallerIdentity,
    pub client: ClientInfo,
}

impl Actor {
    pub fn new(identity: CallerIdentity, client: ClientInfo) -> Self {
        Self { identity, client }
    }

    pub fn user_id(&self) -> Uuid {
        self.identity.user_id
    }
}

/// SHA-256 hex digest. Tokens are only ever stored in this form.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// 32 random bytes, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn Store>,
    session_ttl: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>, session_ttl: Duration) -> Self {
        Self { store, session_ttl }
    }

    /// Resolve the caller from a session id or a bearer token.
    ///
    /// An unknown or expired session falls through to the bearer token, so a
    /// stale browser cookie never masks a valid CLI token.
    pub async fn resolve(
        &self,
        session_id: Option<&str>,
        bearer: Option<&str>,
    ) -> Result<CallerIdentity, ServiceError> {
        let now = Utc::now();

        if let Some(session_id) = session_id.and_then(|s| Uuid::parse_str(s.trim()).ok()) {
            if let Some(session) = self.store.find_session(session_id).await? {
                if session.is_valid_at(now) {
                    if let Some(user) = self.store.find_user(session.user_id).await? {
                        return Ok(CallerIdentity::from(&user));
                    }
                }
            }
        }

        if let Some(token) = bearer.map(str::trim).filter(|t| !t.is_empty()) {
            let hash = hash_token(token);
            if let Some(user) = self.store.find_user_by_token_hash(&hash, now).await? {
                return Ok(CallerIdentity::from(&user));
            }
            tracing::debug!("Bearer token did not match an active API token");
        }

        Err(ServiceError::Unauthorized)
    }

    /// Called by the OAuth collaborator after a successful external login.
    /// Finds or creates the user and opens a session for them.
    #[tracing::instrument(skip(self, profile))]
    pub async fn establish_session(
        &self,
        profile: &ExternalProfile,
    ) -> Result<(User, Session), ServiceError> {
        let email = profile.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ServiceError::Validation(
                "External profile has no usable email".to_string(),
            ));
        }

        let user = self.store.upsert_user(profile).await?;
        let session = Session::new(user.id, Utc::now() + self.session_ttl);
        self.store.insert_session(&session).await?;

        tracing::info!(user_id = %user.id, "Session established");
        Ok((user, session))
    }
}
