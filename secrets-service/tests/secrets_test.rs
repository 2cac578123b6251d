//! Secrets: encryption at rest, per-environment values, import and export.

mod common;

use axum::http::{header, StatusCode};
use common::{parse_id, TestApp};
use serde_json::json;
use uuid::Uuid;

async fn project_with_owner(app: &TestApp) -> (common::TestUser, Uuid, Uuid) {
    let alice = app.login("alice@example.com").await;
    let org_id = app.create_org(&alice, "Acme").await;
    let project_id = app.create_project(&alice, org_id, "Backend").await;
    (alice, org_id, project_id)
}

#[tokio::test]
async fn values_are_stored_encrypted_and_returned_decrypted() {
    // Arrange
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;

    // Act
    let created = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &alice,
            json!({
                "key": "STRIPE_KEY",
                "description": "Payments",
                "values": [
                    { "environment": "development", "value": "sk_test_123" },
                    { "environment": "production", "value": "sk_live_456" }
                ]
            }),
        )
        .await;

    // Assert
    assert_eq!(created.status, StatusCode::CREATED, "{}", created.text);
    let secret_id = parse_id(&created.json()["id"]);

    let stored = app.state.store.find_secret(secret_id).await.unwrap().unwrap();
    assert_eq!(stored.values.len(), 2);
    for value in &stored.values {
        assert!(!value.encrypted_value.contains("sk_"));
    }

    let listed = app
        .get(&format!("/projects/{}/secrets", project_id), &alice)
        .await
        .json();
    let values = listed[0]["values"].as_array().unwrap();
    let plain: Vec<&str> = values.iter().map(|v| v["value"].as_str().unwrap()).collect();
    assert!(plain.contains(&"sk_test_123"));
    assert!(plain.contains(&"sk_live_456"));
}

#[tokio::test]
async fn duplicate_keys_conflict() {
    let app = TestApp::spawn();
    let (alice, org_id, project_id) = project_with_owner(&app).await;
    let other_project_id = app.create_project(&alice, org_id, "Frontend").await;
    let body = json!({
        "key": "API_URL",
        "values": [{ "environment": "staging", "value": "https://staging.example.com" }]
    });

    let first = app
        .post(&format!("/projects/{}/secrets", project_id), &alice, body.clone())
        .await;
    let second = app
        .post(&format!("/projects/{}/secrets", project_id), &alice, body.clone())
        .await;
    let elsewhere = app
        .post(&format!("/projects/{}/secrets", other_project_id), &alice, body)
        .await;

    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(second.status, StatusCode::CONFLICT);
    assert_eq!(second.error_kind(), "DuplicateKey");
    assert_eq!(elsewhere.status, StatusCode::CREATED, "{}", elsewhere.text);
}

#[tokio::test]
async fn empty_value_sets_are_rejected() {
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;

    let response = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &alice,
            json!({ "key": "EMPTY", "values": [] }),
        )
        .await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_kind(), "ValidationError");
}

#[tokio::test]
async fn environment_filter_omits_secrets_without_that_environment() {
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;
    let path = format!("/projects/{}/secrets", project_id);
    app.post(
        &path,
        &alice,
        json!({ "key": "DEV_ONLY", "values": [{ "environment": "development", "value": "a" }] }),
    )
    .await;
    app.post(
        &path,
        &alice,
        json!({
            "key": "BOTH",
            "values": [
                { "environment": "development", "value": "b" },
                { "environment": "production", "value": "c" }
            ]
        }),
    )
    .await;

    let listed = app
        .get(&format!("{}?environment=production", path), &alice)
        .await
        .json();

    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["key"], "BOTH");
    assert_eq!(listed[0]["values"].as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["values"][0]["value"], "c");
}

#[tokio::test]
async fn update_replaces_every_value() {
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;
    let created = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &alice,
            json!({
                "key": "TOKEN",
                "values": [
                    { "environment": "development", "value": "old-dev" },
                    { "environment": "staging", "value": "old-staging" }
                ]
            }),
        )
        .await;
    let secret_id = parse_id(&created.json()["id"]);

    let updated = app
        .put(
            &format!("/projects/{}/secrets/{}", project_id, secret_id),
            &alice,
            json!({ "values": [{ "environment": "production", "value": "new-prod" }] }),
        )
        .await;

    assert_eq!(updated.status, StatusCode::OK, "{}", updated.text);
    let values = updated.json()["values"].as_array().unwrap().clone();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0]["environment"], "production");
    assert_eq!(values[0]["value"], "new-prod");
}

#[tokio::test]
async fn secret_from_another_project_is_not_found() {
    let app = TestApp::spawn();
    let (alice, org_id, project_id) = project_with_owner(&app).await;
    let other_project = app.create_project(&alice, org_id, "Frontend").await;
    let created = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &alice,
            json!({ "key": "K", "values": [{ "environment": "development", "value": "v" }] }),
        )
        .await;
    let secret_id = parse_id(&created.json()["id"]);

    let response = app
        .delete(&format!("/projects/{}/secrets/{}", other_project, secret_id), &alice)
        .await;

    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn members_read_but_cannot_write() {
    let app = TestApp::spawn();
    let (alice, org_id, project_id) = project_with_owner(&app).await;
    let bob = app.login("bob@example.com").await;
    app.add_org_member(org_id, &alice, &bob, "member").await;
    app.post(
        &format!("/projects/{}/members", project_id),
        &alice,
        json!({ "email": "bob@example.com", "role": "member" }),
    )
    .await;

    let read = app
        .get(&format!("/projects/{}/secrets", project_id), &bob)
        .await;
    let write = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &bob,
            json!({ "key": "X", "values": [{ "environment": "development", "value": "y" }] }),
        )
        .await;

    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(write.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn org_membership_alone_does_not_grant_secret_access() {
    let app = TestApp::spawn();
    let (alice, org_id, project_id) = project_with_owner(&app).await;
    let bob = app.login("bob@example.com").await;
    app.add_org_member(org_id, &alice, &bob, "admin").await;

    let response = app
        .get(&format!("/projects/{}/secrets", project_id), &bob)
        .await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(response.error_kind(), "NotAMember");
}

#[tokio::test]
async fn import_merges_into_one_environment() {
    // Arrange
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;
    app.post(
        &format!("/projects/{}/secrets", project_id),
        &alice,
        json!({
            "key": "DATABASE_URL",
            "values": [{ "environment": "development", "value": "postgres://dev" }]
        }),
    )
    .await;

    // Act
    let imported = app
        .post(
            &format!("/projects/{}/secrets/import", project_id),
            &alice,
            json!({
                "environment": "production",
                "content": "# production\nDATABASE_URL=postgres://prod\nREDIS_URL=\"redis://prod:6379\"\n"
            }),
        )
        .await;

    // Assert
    assert_eq!(imported.status, StatusCode::OK, "{}", imported.text);
    assert_eq!(imported.json()["created"], 1);
    assert_eq!(imported.json()["updated"], 1);

    let listed = app
        .get(&format!("/projects/{}/secrets", project_id), &alice)
        .await
        .json();
    let database = listed
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["key"] == "DATABASE_URL")
        .unwrap()
        .clone();
    assert_eq!(database["values"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn export_renders_sorted_dotenv() {
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;
    app.post(
        &format!("/projects/{}/secrets/import", project_id),
        &alice,
        json!({ "environment": "staging", "content": "ZETA=last\nALPHA=first\n" }),
    )
    .await;

    let exported = app
        .get(
            &format!("/projects/{}/secrets/export?environment=staging", project_id),
            &alice,
        )
        .await;

    assert_eq!(exported.status, StatusCode::OK);
    assert!(exported
        .headers
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert_eq!(exported.text, "ALPHA=\"first\"\nZETA=\"last\"\n");
}

#[tokio::test]
async fn deleting_a_project_removes_its_secrets() {
    let app = TestApp::spawn();
    let (alice, _, project_id) = project_with_owner(&app).await;
    let created = app
        .post(
            &format!("/projects/{}/secrets", project_id),
            &alice,
            json!({ "key": "K", "values": [{ "environment": "development", "value": "v" }] }),
        )
        .await;
    let secret_id = parse_id(&created.json()["id"]);

    app.delete(&format!("/projects/{}", project_id), &alice).await;

    assert!(app.state.store.find_secret(secret_id).await.unwrap().is_none());
}
