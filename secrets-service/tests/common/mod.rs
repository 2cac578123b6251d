//! Shared harness for secrets-service integration tests.
//!
//! Every test gets its own in-memory store and router; requests go through
//! the full middleware stack with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

pub mod failing_store;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use secrecy::Secret;
use secrets_service::{
    build_router,
    config::{
        DatabaseConfig, Environment, RateLimitConfig, SecretsConfig, SecurityConfig,
        MEMORY_DATABASE_URL,
    },
    models::ExternalProfile,
    services::{MemoryStore, Store},
    AppState,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_ENCRYPTION_KEY: &str = "test-encryption-key-0123456789abcdef";

pub fn test_config() -> SecretsConfig {
    SecretsConfig {
        common: service_core::config::Config { port: 0 },
        environment: Environment::Dev,
        service_name: "secrets-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: MEMORY_DATABASE_URL.to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        encryption_key: Secret::new(TEST_ENCRYPTION_KEY.to_string()),
        session_cookie_name: "session".to_string(),
        session_ttl_hours: 24,
        invitation_expiry_hours: 168,
        api_token_expiry_days: 90,
        audit_protected_actions: vec!["organization.create".to_string()],
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        rate_limit: RateLimitConfig {
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        },
    }
}

/// A logged-in user and the cookie that identifies them.
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub session_id: Uuid,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or(Value::Null)
    }

    /// The `error` kind of a failure body.
    pub fn error_kind(&self) -> String {
        self.json()["error"].as_str().unwrap_or_default().to_string()
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with_store(Arc::new(MemoryStore::new()))
    }

    pub fn spawn_with_store(store: Arc<dyn Store>) -> Self {
        let state = AppState::new(test_config(), store).expect("Failed to build app state");
        let router = build_router(state.clone());
        Self { state, router }
    }

    /// Run the login collaborator's half: upsert the user and open a session.
    pub async fn login(&self, email: &str) -> TestUser {
        let profile = ExternalProfile {
            email: email.to_string(),
            name: Some(email.split('@').next().unwrap_or("user").to_string()),
            image: None,
        };
        let (user, session) = self
            .state
            .identity
            .establish_session(&profile)
            .await
            .expect("Failed to establish session");

        TestUser {
            id: user.id,
            email: user.email,
            session_id: session.id,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        user: Option<&TestUser>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(user) = user {
            builder = builder.header(header::COOKIE, format!("session={}", user.session_id));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        self.dispatch(request).await
    }

    pub async fn dispatch(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();

        TestResponse {
            status,
            headers,
            text: String::from_utf8_lossy(&bytes).to_string(),
        }
    }

    pub async fn get(&self, path: &str, user: &TestUser) -> TestResponse {
        self.send(Method::GET, path, Some(user), None).await
    }

    pub async fn post(&self, path: &str, user: &TestUser, body: Value) -> TestResponse {
        self.send(Method::POST, path, Some(user), Some(body)).await
    }

    pub async fn put(&self, path: &str, user: &TestUser, body: Value) -> TestResponse {
        self.send(Method::PUT, path, Some(user), Some(body)).await
    }

    pub async fn delete(&self, path: &str, user: &TestUser) -> TestResponse {
        self.send(Method::DELETE, path, Some(user), None).await
    }

    /// Create an organization owned by `owner` and return its id.
    pub async fn create_org(&self, owner: &TestUser, name: &str) -> Uuid {
        let response = self
            .post("/organizations", owner, serde_json::json!({ "name": name }))
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
        parse_id(&response.json()["id"])
    }

    /// Invite `email` with `role` and accept as `invitee`.
    pub async fn add_org_member(
        &self,
        org_id: Uuid,
        inviter: &TestUser,
        invitee: &TestUser,
        role: &str,
    ) {
        let invite = self
            .post(
                &format!("/organizations/{}/invite", org_id),
                inviter,
                serde_json::json!({ "email": invitee.email, "role": role }),
            )
            .await;
        assert_eq!(invite.status, StatusCode::CREATED, "{}", invite.text);

        let token = invite.json()["token"].as_str().unwrap().to_string();
        let accept = self
            .post(
                &format!("/organizations/{}/invite/accept", org_id),
                invitee,
                serde_json::json!({ "token": token }),
            )
            .await;
        assert_eq!(accept.status, StatusCode::OK, "{}", accept.text);
    }

    pub async fn create_project(&self, owner: &TestUser, org_id: Uuid, name: &str) -> Uuid {
        let response = self
            .post(
                "/projects",
                owner,
                serde_json::json!({ "orgId": org_id, "name": name }),
            )
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.text);
        parse_id(&response.json()["id"])
    }
}

pub fn parse_id(value: &Value) -> Uuid {
    Uuid::parse_str(value.as_str().expect("id is not a string")).expect("id is not a UUID")
}
