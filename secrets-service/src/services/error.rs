use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::{AppError, ErrorBody};
use thiserror::Error;

use crate::models::ScopeKind;

/// Closed set of failures a domain operation can surface. Handlers match on
/// the variant (or `kind()`), never on message text.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("You are not a member of this {0}")]
    NotAMember(ScopeKind),

    #[error("Insufficient permissions")]
    InsufficientRole,

    #[error("This {0} must keep at least one owner")]
    LastOwnerViolation(ScopeKind),

    #[error("{0}")]
    SelfModificationForbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    DuplicateKey(String),

    #[error("{0}")]
    AlreadyMember(String),

    #[error("User must be a member of the organization before joining its projects")]
    NotOrgMember,

    #[error("{0}")]
    Validation(String),

    #[error("Failed to decrypt secret value")]
    Decryption,

    #[error("Failed to encrypt secret value")]
    Encryption,

    #[error("Cannot delete account while sole owner of organization '{0}'")]
    OwnershipConflict(String),

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Machine-readable error kind returned to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Unauthorized => "Unauthorized",
            ServiceError::NotAMember(_) => "NotAMember",
            ServiceError::InsufficientRole => "InsufficientRole",
            ServiceError::LastOwnerViolation(_) => "LastOwnerViolation",
            ServiceError::SelfModificationForbidden(_) => "SelfModificationForbidden",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::DuplicateKey(_) => "DuplicateKey",
            ServiceError::AlreadyMember(_) => "AlreadyMember",
            ServiceError::NotOrgMember => "NotOrgMember",
            ServiceError::Validation(_) => "ValidationError",
            ServiceError::Decryption => "DecryptionError",
            ServiceError::Encryption => "EncryptionError",
            ServiceError::OwnershipConflict(_) => "OwnershipConflict",
            ServiceError::Database(_) => "DatabaseError",
            ServiceError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServiceError::NotAMember(_)
            | ServiceError::InsufficientRole
            | ServiceError::SelfModificationForbidden(_)
            | ServiceError::NotOrgMember => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::LastOwnerViolation(_)
            | ServiceError::DuplicateKey(_)
            | ServiceError::AlreadyMember(_)
            | ServiceError::OwnershipConflict(_) => StatusCode::CONFLICT,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Decryption
            | ServiceError::Encryption
            | ServiceError::Database(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Infrastructure causes are replaced by a generic text.
    fn public_message(&self) -> String {
        match self {
            ServiceError::Database(_) | ServiceError::Internal(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Postgres unique violations become `DuplicateKey`; everything else is opaque.
impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return ServiceError::DuplicateKey("Resource already exists".to_string());
            }
        }
        ServiceError::Database(err)
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ServiceError::Validation(crate::utils::validation::describe(&errors))
    }
}

impl From<AppError> for ServiceError {
    fn from(err: AppError) -> Self {
        ServiceError::Internal(anyhow::anyhow!(err))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "Request rejected");
        }

        (
            status,
            Json(ErrorBody {
                error: self.kind().to_string(),
                message: self.public_message(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(ServiceError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServiceError::NotAMember(ScopeKind::Organization).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServiceError::LastOwnerViolation(ScopeKind::Project).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::OwnershipConflict("Acme".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(ServiceError::NotOrgMember.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ServiceError::Decryption.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ServiceError::Internal(anyhow::anyhow!("connection refused at 10.0.0.5"));
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.kind(), "InternalError");

        let err = ServiceError::NotFound("Project");
        assert_eq!(err.public_message(), "Project not found");
    }
}
