pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Json, Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, RequestId, REQUEST_ID_HEADER},
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::SecretsConfig;
use crate::middleware::{auth_middleware, http_metrics_middleware};
use crate::services::{
    AccessControl, AuditTrail, Cipher, IdentityResolver, Metrics, OrganizationService,
    ProjectService, SecretService, ServiceError, Store, UserService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: SecretsConfig,
    pub store: Arc<dyn Store>,
    pub metrics: Metrics,
    pub identity: IdentityResolver,
    pub access: AccessControl,
    pub audit: AuditTrail,
    pub organizations: OrganizationService,
    pub projects: ProjectService,
    pub secrets: SecretService,
    pub users: UserService,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire every service over `store`. Fails if the encryption key is unusable.
    pub fn new(config: SecretsConfig, store: Arc<dyn Store>) -> Result<Self, AppError> {
        let metrics = Metrics::new().map_err(|e| AppError::InternalError(anyhow::Error::new(e)))?;
        let cipher = Cipher::new(config.encryption_key.expose_secret())
            .map_err(AppError::ConfigError)?;

        let identity = IdentityResolver::new(
            store.clone(),
            chrono::Duration::hours(config.session_ttl_hours),
        );
        let access = AccessControl::new(store.clone(), metrics.clone());
        let audit = AuditTrail::new(
            store.clone(),
            access.clone(),
            metrics.clone(),
            config.audit_protected_actions.clone(),
        );

        let organizations = OrganizationService::new(
            store.clone(),
            access.clone(),
            audit.clone(),
            chrono::Duration::hours(config.invitation_expiry_hours),
        );
        let projects = ProjectService::new(store.clone(), access.clone(), audit.clone());
        let secrets = SecretService::new(store.clone(), access.clone(), audit.clone(), cipher);
        let users = UserService::new(
            store.clone(),
            audit.clone(),
            chrono::Duration::days(config.api_token_expiry_days),
        );

        let ip_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        );

        Ok(Self {
            config,
            store,
            metrics,
            identity,
            access,
            audit,
            organizations,
            projects,
            secrets,
            users,
            ip_rate_limiter,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    use handlers::{audit, organizations, projects, secrets, users};

    let protected = Router::new()
        // Organizations
        .route(
            "/organizations",
            post(organizations::create_organization).get(organizations::list_organizations),
        )
        .route(
            "/organizations/:org_id",
            get(organizations::get_organization)
                .put(organizations::update_organization)
                .delete(organizations::delete_organization),
        )
        .route(
            "/organizations/:org_id/invite",
            post(organizations::invite_member),
        )
        .route(
            "/organizations/:org_id/invite/accept",
            post(organizations::accept_invitation),
        )
        .route(
            "/organizations/:org_id/members/:user_id",
            put(organizations::update_member_role).delete(organizations::remove_member),
        )
        // Audit
        .route(
            "/organizations/:org_id/audit",
            get(audit::list_audit_logs).delete(audit::purge_audit_logs),
        )
        .route(
            "/organizations/:org_id/audit/filters",
            get(audit::audit_filter_options),
        )
        // Projects
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/:project_id",
            get(projects::get_project)
                .put(projects::update_project)
                .delete(projects::delete_project),
        )
        .route(
            "/projects/:project_id/members",
            get(projects::list_project_members).post(projects::add_project_member),
        )
        .route(
            "/projects/:project_id/members/:user_id",
            put(projects::update_project_member_role).delete(projects::remove_project_member),
        )
        // Secrets
        .route(
            "/projects/:project_id/secrets",
            get(secrets::list_secrets).post(secrets::create_secret),
        )
        .route(
            "/projects/:project_id/secrets/import",
            post(secrets::import_secrets),
        )
        .route(
            "/projects/:project_id/secrets/export",
            get(secrets::export_secrets),
        )
        .route(
            "/projects/:project_id/secrets/:secret_id",
            put(secrets::update_secret).delete(secrets::delete_secret),
        )
        // Current user
        .route(
            "/users/me",
            get(users::get_me)
                .put(users::update_me)
                .delete(users::delete_me),
        )
        .route("/users/me/token", post(users::rotate_api_token))
        .layer(from_fn_with_state(state.clone(), auth_middleware));

    let ip_limiter = state.ip_rate_limiter.clone();
    let metrics = state.metrics.clone();
    let cors = cors_layer(&state.config.security.allowed_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .merge(protected)
        // Route-level so the matched path template is available as a label
        .route_layer(from_fn_with_state(metrics, http_metrics_middleware))
        .with_state(state)
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map_or("-", |id| id.0.as_str());

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        // Credentialed CORS cannot use a wildcard origin
        .filter(|origin| origin.as_str() != "*")
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Service health check. Fails with 500 when the store is unreachable.
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.store.health_check().await.inspect_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "store": "up"
        }
    })))
}
