pub mod auth;
pub mod metrics;

pub use auth::{auth_middleware, AuthActor, AuthUser};
pub use metrics::http_metrics_middleware;
