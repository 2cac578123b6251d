use axum::{
    extract::{FromRequest, FromRequestParts, Path, Query, Request},
    http::request::Parts,
    Json,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::services::ServiceError;

/// Flatten validator output into one sorted, client-facing sentence.
pub fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => message.to_string(),
                None => format!("{} is invalid", field),
            })
        })
        .collect();
    messages.sort();
    messages.dedup();
    messages.join("; ")
}

/// Trim `value` and require `min..=max` characters.
pub fn trimmed(field: &str, value: &str, min: usize, max: usize) -> Result<String, ServiceError> {
    let value = value.trim();
    let len = value.chars().count();
    if len < min || len > max {
        return Err(ServiceError::Validation(format!(
            "{} must be {}-{} characters",
            field, min, max
        )));
    }
    Ok(value.to_string())
}

/// Blank strings become `None`.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(value.trim())
        .map_err(|_| ServiceError::Validation(format!("{} must be a valid UUID", field)))
}

/// JSON body that is deserialized and validated; failures become `ValidationError`.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ServiceError::Validation(format!("Invalid request body: {}", e.body_text())))?;

        value.validate()?;

        Ok(ValidatedJson(value))
    }
}

/// Query string counterpart of [`ValidatedJson`].
pub struct ValidatedQuery<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequestParts<S> for ValidatedQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ServiceError::Validation(format!("Invalid query string: {}", e.body_text())))?;

        value.validate()?;

        Ok(ValidatedQuery(value))
    }
}

/// Path parameters whose parse failures use the service error body.
pub struct ValidatedPath<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequestParts<S> for ValidatedPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ServiceError::Validation(format!("Invalid path: {}", e.body_text())))?;
        Ok(ValidatedPath(value))
    }
}
