//! HTTP handlers for secrets-service.
//!
//! Handlers stay thin: extract, call one domain operation, shape the response.

pub mod audit;
pub mod metrics;
pub mod organizations;
pub mod projects;
pub mod secrets;
pub mod users;
