//! Integration tests for function management.
//!
//! Cover create/list/get/update/delete through the full router, the
//! version and status rules of updates, and the gateway token check.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::{body_json, function_body, function_uri, functions_uri, spawn_app, spawn_app_with, test_config};
use serde_json::json;

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_applies_defaults() {
    let app = spawn_app();

    let response = app
        .post_json(&functions_uri(), json!({"name": "hello", "code": "exports.handler = async () => 1;"}))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = body_json(response).await["data"].clone();

    assert_eq!(data["name"], "hello");
    assert_eq!(data["runtime"], "nodejs18");
    assert_eq!(data["language"], "javascript");
    assert_eq!(data["entry_point"], "index.handler");
    assert_eq!(data["timeout_secs"], 30);
    assert_eq!(data["memory_mb"], 128);
    assert_eq!(data["status"], "draft");
    assert_eq!(data["version"], 1);
    assert_eq!(data["is_active"], true);
    assert_eq!(data["is_public"], false);
    assert_eq!(data["function_url"], "http://functions.test/p/7/functions/hello");
    assert!(data.get("artifact_path").is_none(), "host paths are never exposed");

    app.shutdown().await;
}

#[tokio::test]
async fn create_rejects_invalid_definitions() {
    let app = spawn_app();

    let cases = [
        json!({"name": "", "code": "x"}),
        json!({"name": "bad name!", "code": "x"}),
        json!({"name": "ok", "code": "x", "runtime": "cobol85"}),
        json!({"name": "ok", "code": "x", "timeout_secs": 0}),
        json!({"name": "ok", "code": "x", "timeout_secs": 901}),
        json!({"name": "ok", "code": "x", "memory_mb": 1_000_000}),
        json!({"name": "ok", "code": "x", "environment": {"A": 1}}),
    ];
    for body in cases {
        let response = app.post_json(&functions_uri(), body.clone()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }

    app.shutdown().await;
}

#[tokio::test]
async fn duplicate_name_is_a_conflict() {
    let app = spawn_app();
    app.create_function(function_body("dup")).await;

    let response = app.post_json(&functions_uri(), function_body("DUP")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "CONFLICT");

    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_and_get_are_scoped_to_the_project() {
    let app = spawn_app();
    let a = app.create_function(function_body("alpha")).await;
    app.create_function(function_body("beta")).await;

    let json = body_json(app.get(&functions_uri()).await).await;
    let names: Vec<_> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["alpha", "beta"]);

    let id = a["id"].as_i64().unwrap();
    let response = app.get(&function_uri(id, "")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["name"], "alpha");

    let other_project = format!("/api/v1/projects/999/functions/{id}");
    let response = app.get(&other_project).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_code_updates_reach_version_four() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("counter")).await;
    let id = f["id"].as_i64().unwrap();

    for n in 1..=3 {
        let code = format!("exports.handler = async () => {n};");
        let response = app.put_json(&function_uri(id, ""), json!({"code": code})).await;
        assert_eq!(response.status(), StatusCode::OK);
        let data = body_json(response).await["data"].clone();
        assert_eq!(data["version"], 1 + n);
        assert_eq!(data["status"], "draft");
    }

    app.shutdown().await;
}

#[tokio::test]
async fn settings_update_keeps_version_and_status() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("settings")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app
        .put_json(
            &function_uri(id, ""),
            json!({"timeout_secs": 60, "environment": {"MODE": "prod"}, "is_public": true}),
        )
        .await;
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["version"], 1);
    assert_eq!(data["status"], "deployed");
    assert_eq!(data["timeout_secs"], 60);
    assert_eq!(data["environment"], json!({"MODE": "prod"}));

    let response = app
        .put_json(&function_uri(id, ""), json!({"code": f["code"]}))
        .await;
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["version"], 1, "identical code is not a new version");

    app.shutdown().await;
}

#[tokio::test]
async fn rename_recomputes_url() {
    let app = spawn_app();
    let f = app.create_function(function_body("old-name")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.put_json(&function_uri(id, ""), json!({"name": "new-name"})).await;
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["name"], "new-name");
    assert_eq!(data["function_url"], "http://functions.test/p/7/functions/new-name");

    app.shutdown().await;
}

#[tokio::test]
async fn runtime_switch_carries_default_entry_point() {
    let app = spawn_app();
    let f = app.create_function(function_body("switch")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app
        .put_json(
            &function_uri(id, ""),
            json!({"runtime": "python3.11", "code": "def handler(event):\n    return event\n"}),
        )
        .await;
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["runtime"], "python3.11");
    assert_eq!(data["language"], "python");
    assert_eq!(data["entry_point"], "handler");

    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_returns_no_content_then_not_found() {
    let app = spawn_app();
    let f = app.create_function(function_body("gone")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.request(Method::DELETE, &function_uri(id, ""), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.get(&function_uri(id, "")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.request(Method::DELETE, &function_uri(id, ""), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Gateway token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_token_guards_management_routes() {
    let mut config = test_config();
    config.gateway_token = Some("s3cret".into());
    let app = spawn_app_with(config);

    let response = app.get(&functions_uri()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .uri(functions_uri())
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::UNAUTHORIZED);

    let (name, value) = common::bearer("s3cret");
    let request = Request::builder()
        .uri(functions_uri())
        .header(name, value)
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(request).await.status(), StatusCode::OK);

    // Health and public routes stay open.
    assert_eq!(app.get("/health").await.status(), StatusCode::OK);
    assert_eq!(
        app.get(&common::public_uri("missing")).await.status(),
        StatusCode::NOT_FOUND
    );

    app.shutdown().await;
}
