//! Health, metrics and caller identification.

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use common::TestApp;

#[tokio::test]
async fn health_check_returns_200() {
    // Arrange
    let app = TestApp::spawn();

    // Act
    let response = app
        .dispatch(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    // Assert
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "secrets-service-test");
    assert_eq!(body["checks"]["store"], "up");
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let app = TestApp::spawn();

    let response = app
        .dispatch(
            Request::get("/health")
                .header("x-request-id", "req-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.headers.get("x-request-id").unwrap(), "req-123");
    assert_eq!(
        response.headers.get("x-content-type-options").unwrap(),
        "nosniff"
    );
}

#[tokio::test]
async fn metrics_exposes_request_counters() {
    let app = TestApp::spawn();
    app.dispatch(Request::get("/health").body(Body::empty()).unwrap())
        .await;

    let response = app
        .dispatch(Request::get("/metrics").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.text.contains("http_requests_total"));
    assert!(response.text.contains("path=\"/health\""));
}

#[tokio::test]
async fn protected_routes_require_identity() {
    let app = TestApp::spawn();

    let response = app.send(Method::GET, "/organizations", None, None).await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.error_kind(), "Unauthorized");
}

#[tokio::test]
async fn unknown_session_is_unauthorized() {
    let app = TestApp::spawn();

    let response = app
        .dispatch(
            Request::get("/users/me")
                .header(header::COOKIE, format!("session={}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn api_token_authenticates_as_bearer() {
    // Arrange
    let app = TestApp::spawn();
    let user = app.login("cli@example.com").await;
    let issued = app.send(Method::POST, "/users/me/token", Some(&user), None).await;
    assert_eq!(issued.status, StatusCode::CREATED);
    let token = issued.json()["token"].as_str().unwrap().to_string();

    // Act
    let response = app
        .dispatch(
            Request::get("/users/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    // Assert
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["user"]["email"], "cli@example.com");
}

#[tokio::test]
async fn rotating_the_token_revokes_the_previous_one() {
    let app = TestApp::spawn();
    let user = app.login("rotate@example.com").await;

    let first = app.send(Method::POST, "/users/me/token", Some(&user), None).await;
    let first = first.json()["token"].as_str().unwrap().to_string();
    app.send(Method::POST, "/users/me/token", Some(&user), None).await;

    let response = app
        .dispatch(
            Request::get("/users/me")
                .header(header::AUTHORIZATION, format!("Bearer {}", first))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
}
