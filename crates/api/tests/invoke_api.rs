//! Integration tests for function invocation.
//!
//! Invoke-by-id and public invoke-by-name, their preconditions, status
//! mapping and the ledger rows each invocation leaves behind.

mod common;

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use cloudbox_core::sandbox::mock::MockBehavior;
use cloudbox_core::sandbox::OutputDocument;
use cloudbox_db::store::ExecutionStore;
use common::{body_json, function_body, function_uri, public_uri, spawn_app, PROJECT_ID};
use serde_json::json;

// ---------------------------------------------------------------------------
// Invoke by id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn execute_success_records_one_row() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("echo")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app
        .post_json(
            &function_uri(id, "/execute"),
            json!({"data": {"x": 1}, "headers": {"x-trace": "abc"}}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["success"], true);
    assert_eq!(data["status_code"], 200);
    assert_eq!(data["response"], json!({"x": 1}));
    assert_eq!(data["function_version"], 1);
    assert!(data["execution_id"].as_str().is_some_and(|s| !s.is_empty()));
    assert!(data["logs"].as_str().unwrap().contains("mock run"));

    let input = app.sandbox.last_input().unwrap();
    assert_eq!(input.headers, json!({"x-trace": "abc"}));
    assert_eq!(input.method, "POST");

    assert_eq!(app.execution_count(id).await, 1);
    app.shutdown().await;
}

#[tokio::test]
async fn execute_runtime_error_maps_to_500() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("broken")).await;
    let id = f["id"].as_i64().unwrap();
    app.sandbox.set_behavior(MockBehavior::Respond(OutputDocument {
        success: false,
        data: None,
        error: Some("boom".into()),
        status_code: None,
    }));

    let response = app.post_json(&function_uri(id, "/execute"), json!({"data": null})).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["success"], false);
    assert_eq!(data["error"], "boom");
    assert_eq!(data["error_code"], "runtime_error");

    assert_eq!(app.execution_count(id).await, 1);
    app.shutdown().await;
}

#[tokio::test]
async fn one_second_timeout_stops_five_second_sleep() {
    let app = spawn_app();
    let mut body = function_body("sleepy");
    body["timeout_secs"] = json!(1);
    let f = app.deployed_function(body).await;
    let id = f["id"].as_i64().unwrap();
    app.sandbox.set_behavior(MockBehavior::Sleep(Duration::from_secs(5)));

    let started = Instant::now();
    let response = app.post_json(&function_uri(id, "/execute"), json!({})).await;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["error_code"], "timeout");
    assert_eq!(data["status_code"], 504);
    assert!(data["logs"].as_str().unwrap().contains("sleeping"));

    assert_eq!(app.execution_count(id).await, 1);
    let rows = app.executions.list_by_function(PROJECT_ID, id, 10, 0).await.unwrap();
    let row = &rows[0];
    assert_eq!(row.error_code.as_deref(), Some("timeout"));
    assert_eq!(row.status_code, 504);
    let recorded = (row.completed_at - row.started_at).to_std().unwrap();
    assert!(recorded >= Duration::from_millis(900), "recorded {recorded:?}");
    assert!(recorded < Duration::from_secs(2), "recorded {recorded:?}");
    app.shutdown().await;
}

#[tokio::test]
async fn out_of_memory_is_distinct() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("hungry")).await;
    let id = f["id"].as_i64().unwrap();
    app.sandbox.set_behavior(MockBehavior::OutOfMemory);

    let response = app.post_json(&function_uri(id, "/execute"), json!({})).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let data = body_json(response).await["data"].clone();
    assert_eq!(data["error_code"], "out_of_memory");
    assert!(data["memory_usage_bytes"].as_u64().unwrap() > 128 * 1024 * 1024);

    app.shutdown().await;
}

#[tokio::test]
async fn non_deployed_function_is_rejected_without_a_row() {
    let app = spawn_app();
    let f = app.create_function(function_body("draft")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.post_json(&function_uri(id, "/execute"), json!({})).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["code"], "PRECONDITION_FAILED");

    assert_eq!(app.sandbox.runs(), 0);
    assert_eq!(app.execution_count(id).await, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn inactive_function_is_rejected_without_a_row() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("paused")).await;
    let id = f["id"].as_i64().unwrap();
    app.put_json(&function_uri(id, ""), json!({"is_active": false})).await;

    let response = app.post_json(&function_uri(id, "/execute"), json!({})).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.execution_count(id).await, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn execute_rejects_non_object_body() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("strict")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.post_json(&function_uri(id, "/execute"), json!([1, 2])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.execution_count(id).await, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn execute_body_without_data_invokes_with_null() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("bare")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app
        .post_json(&function_uri(id, "/execute"), json!({"headers": {"x-trace": "t"}, "x": 1}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let input = app.sandbox.last_input().unwrap();
    assert_eq!(input.data, json!(null));
    assert_eq!(input.headers, json!({"x-trace": "t"}));
    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn logs_are_newest_first_and_paginated() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("history")).await;
    let id = f["id"].as_i64().unwrap();

    for n in 0..3 {
        app.post_json(&function_uri(id, "/execute"), json!({"data": {"n": n}})).await;
    }
    app.state.ledger.flush().await;

    let json = body_json(app.get(&function_uri(id, "/logs")).await).await;
    let rows = json["data"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["request_data"], json!({"n": 2}));
    assert_eq!(rows[2]["request_data"], json!({"n": 0}));
    assert_eq!(rows[0]["status"], "success");
    assert_eq!(rows[0]["source"], "http");

    let json = body_json(app.get(&function_uri(id, "/logs?limit=1&offset=1")).await).await;
    let rows = json["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["request_data"], json!({"n": 1}));

    app.shutdown().await;
}

#[tokio::test]
async fn history_outlives_deleted_function() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("ephemeral")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.post_json(&function_uri(id, "/execute"), json!({"data": {"n": 1}})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let execution_id = body_json(response).await["data"]["execution_id"].clone();
    app.state.ledger.flush().await;

    let response = app.request(Method::DELETE, &function_uri(id, ""), None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.get(&function_uri(id, "")).await.status(), StatusCode::NOT_FOUND);

    let response = app.get(&function_uri(id, "/logs")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let rows = body_json(response).await["data"].as_array().unwrap().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["execution_id"], execution_id);
    assert_eq!(rows[0]["request_data"], json!({"n": 1}));

    app.shutdown().await;
}

// ---------------------------------------------------------------------------
// Public invocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn private_function_is_hidden_on_public_path() {
    let app = spawn_app();
    let f = app.deployed_function(function_body("secret")).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.get(&public_uri("secret")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert_eq!(json["error"], "Function 'secret' not found or not public");

    assert_eq!(app.sandbox.runs(), 0);
    assert_eq!(app.execution_count(id).await, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn public_function_not_deployed_is_unavailable() {
    let app = spawn_app();
    let mut body = function_body("soon");
    body["is_public"] = json!(true);
    let f = app.create_function(body).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.get(&public_uri("soon")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.execution_count(id).await, 0);
    app.shutdown().await;
}

#[tokio::test]
async fn public_query_params_become_data() {
    let app = spawn_app();
    let mut body = function_body("greet");
    body["is_public"] = json!(true);
    let f = app.deployed_function(body).await;
    let id = f["id"].as_i64().unwrap();

    let response = app.get(&format!("{}?name=Ada&tag=a&tag=b", public_uri("greet"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"name": "Ada", "tag": ["a", "b"]}));

    app.state.ledger.flush().await;
    let json = body_json(app.get(&function_uri(id, "/logs")).await).await;
    assert_eq!(json["data"][0]["source"], "public");
    assert_eq!(json["data"][0]["method"], "GET");
    assert_eq!(json["data"][0]["path"], "/p/7/functions/greet");
    app.shutdown().await;
}

#[tokio::test]
async fn public_json_envelope_and_custom_status() {
    let app = spawn_app();
    let mut body = function_body("create-thing");
    body["is_public"] = json!(true);
    app.deployed_function(body).await;
    app.sandbox.set_behavior(MockBehavior::Respond(OutputDocument {
        success: true,
        data: Some(json!({"created": true})),
        error: None,
        status_code: Some(201),
    }));

    let request = Request::builder()
        .method(Method::POST)
        .uri(public_uri("create-thing"))
        .header("content-type", "application/json")
        .header("x-forwarded-for", "198.51.100.4")
        .body(Body::from(json!({"data": {"a": 1}, "headers": {"h": "v"}}).to_string()))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await, json!({"created": true}));

    let input = app.sandbox.last_input().unwrap();
    assert_eq!(input.data, json!({"a": 1}));
    assert_eq!(input.headers, json!({"h": "v"}));
    app.shutdown().await;
}

#[tokio::test]
async fn public_failure_renders_error_and_code() {
    let app = spawn_app();
    let mut body = function_body("fails");
    body["is_public"] = json!(true);
    app.deployed_function(body).await;
    app.sandbox.set_behavior(MockBehavior::Respond(OutputDocument {
        success: false,
        data: None,
        error: Some("bad input".into()),
        status_code: Some(422),
    }));

    let response = app.post_json(&public_uri("fails"), json!({"x": 1})).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body_json(response).await,
        json!({"error": "bad input", "code": "runtime_error"})
    );
    app.shutdown().await;
}
