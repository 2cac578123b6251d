use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::Environment;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretValueInput {
    pub environment: Environment,
    pub value: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    #[validate(length(min = 1, max = 256, message = "Key must be 1-256 characters"))]
    pub key: String,

    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub values: Vec<SecretValueInput>,
}

/// Replaces every stored value with `values`. An empty description clears it.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSecretRequest {
    #[validate(length(max = 500, message = "Description must be at most 500 characters"))]
    pub description: Option<String>,

    pub values: Vec<SecretValueInput>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ListSecretsQuery {
    pub environment: Option<Environment>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub environment: Environment,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImportSecretsRequest {
    pub environment: Environment,

    #[validate(length(min = 1, message = "Content is required"))]
    pub content: String,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
}

/// Decrypted view of a secret.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub values: Vec<SecretValueView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretValueView {
    pub environment: Environment,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
