use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use service_core::middleware::client_info::ClientInfo;

use crate::services::{Actor, CallerIdentity, ServiceError};
use crate::AppState;

/// Resolve the caller from the session cookie or `Authorization: Bearer`.
/// Every protected route sits behind this layer.
pub async fn auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let session = jar
        .get(&state.config.session_cookie_name)
        .map(|cookie| cookie.value().to_string());

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    let identity = state
        .identity
        .resolve(session.as_deref(), bearer.as_deref())
        .await?;

    // Store the identity in request extensions so handlers can access it
    req.extensions_mut().insert(identity);

    Ok(next.run(req).await)
}

/// Extractor for the resolved caller.
pub struct AuthUser(pub CallerIdentity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let identity = parts
            .extensions
            .get::<CallerIdentity>()
            .ok_or(ServiceError::Unauthorized)?;

        Ok(AuthUser(identity.clone()))
    }
}

/// Caller plus client details, for operations that write audit entries.
pub struct AuthActor(pub Actor);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthActor
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let AuthUser(identity) = AuthUser::from_request_parts(parts, state).await?;
        let client = match ClientInfo::from_request_parts(parts, state).await {
            Ok(client) => client,
            Err(never) => match never {},
        };

        Ok(AuthActor(Actor::new(identity, client)))
    }
}
