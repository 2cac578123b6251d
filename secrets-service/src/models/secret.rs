//! Secret model - keys owned by a project, with one sealed value per environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Deployment environment a secret value applies to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "secret_environment", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Secret {
    pub id: Uuid,
    pub project_id: Uuid,
    pub key: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn new(project_id: Uuid, key: String, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            key,
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stored value. `encrypted_value` is always cipher output, never plaintext.
#[derive(Debug, Clone, FromRow)]
pub struct SecretValue {
    pub id: Uuid,
    pub secret_id: Uuid,
    pub environment: Environment,
    pub encrypted_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sealed value about to be written.
#[derive(Debug, Clone)]
pub struct NewSecretValue {
    pub environment: Environment,
    pub encrypted_value: String,
}

impl NewSecretValue {
    pub fn into_value(self, secret_id: Uuid, now: DateTime<Utc>) -> SecretValue {
        SecretValue {
            id: Uuid::new_v4(),
            secret_id,
            environment: self.environment,
            encrypted_value: self.encrypted_value,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecretWithValues {
    pub secret: Secret,
    pub values: Vec<SecretValue>,
}
