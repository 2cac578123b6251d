use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

use crate::services::cipher::MIN_SECRET_LEN;

/// Value of `DATABASE_URL` that selects the in-process store.
pub const MEMORY_DATABASE_URL: &str = "memory";

#[derive(Debug, Clone)]
pub struct SecretsConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub encryption_key: Secret<String>,
    pub session_cookie_name: String,
    pub session_ttl_hours: i64,
    pub invitation_expiry_hours: i64,
    pub api_token_expiry_days: i64,
    pub audit_protected_actions: Vec<String>,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url == MEMORY_DATABASE_URL
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl SecretsConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = SecretsConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("secrets-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.trim().is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?,
            },
            encryption_key: Secret::new(get_env("ENCRYPTION_KEY", None, true)?),
            session_cookie_name: get_env("SESSION_COOKIE_NAME", Some("session"), is_prod)?,
            session_ttl_hours: parse_env("SESSION_TTL_HOURS", Some("720"), is_prod)?,
            invitation_expiry_hours: parse_env("INVITATION_EXPIRY_HOURS", Some("168"), is_prod)?,
            api_token_expiry_days: parse_env("API_TOKEN_EXPIRY_DAYS", Some("90"), is_prod)?,
            audit_protected_actions: split_list(&get_env(
                "AUDIT_PROTECTED_ACTIONS",
                Some("organization.create"),
                is_prod,
            )?),
            security: SecurityConfig {
                allowed_origins: split_list(&get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?),
            },
            rate_limit: RateLimitConfig {
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.encryption_key.expose_secret().chars().count() < MIN_SECRET_LEN {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ENCRYPTION_KEY must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }

        for (key, value) in [
            ("SESSION_TTL_HOURS", self.session_ttl_hours),
            ("INVITATION_EXPIRY_HOURS", self.invitation_expiry_hours),
            ("API_TOKEN_EXPIRY_DAYS", self.api_token_expiry_days),
        ] {
            if value <= 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} must be positive",
                    key
                )));
            }
        }

        if self.rate_limit.global_ip_limit == 0 || self.rate_limit.global_ip_window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Rate limit and window must be greater than 0"
            )));
        }

        // In production, ensure stricter validation
        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.database.is_memory() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "The in-memory store is not allowed in production"
                )));
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample() -> SecretsConfig {
        SecretsConfig {
            common: core_config::Config { port: 8080 },
            environment: Environment::Dev,
            service_name: "secrets-service".to_string(),
            service_version: "test".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: MEMORY_DATABASE_URL.to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            encryption_key: Secret::new("k".repeat(32)),
            session_cookie_name: "session".to_string(),
            session_ttl_hours: 24,
            invitation_expiry_hours: 168,
            api_token_expiry_days: 90,
            audit_protected_actions: vec!["organization.create".to_string()],
            security: SecurityConfig {
                allowed_origins: vec!["http://localhost:3000".to_string()],
            },
            rate_limit: RateLimitConfig {
                global_ip_limit: 100,
                global_ip_window_seconds: 60,
            },
        }
    }

    #[test]
    fn sample_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn short_encryption_key_fails_fast() {
        let mut config = sample();
        config.encryption_key = Secret::new("short".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_expiry_is_rejected() {
        let mut config = sample();
        config.invitation_expiry_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_rejects_wildcard_cors_and_memory_store() {
        let mut config = sample();
        config.environment = Environment::Prod;
        config.database.url = "postgres://db/secrets".to_string();
        assert!(config.validate().is_ok());

        config.security.allowed_origins = vec!["*".to_string()];
        assert!(config.validate().is_err());

        config.security.allowed_origins = vec!["https://app.example.com".to_string()];
        config.database.url = MEMORY_DATABASE_URL.to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn lists_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(
            split_list(" organization.create , ,project.create"),
            vec!["organization.create", "project.create"]
        );
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }
}
