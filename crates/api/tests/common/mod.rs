#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use cloudbox_api::config::{EngineConfig, ServerConfig, StoreBackend};
use cloudbox_api::router::build_app_router;
use cloudbox_api::services::{self, Services, Stores};
use cloudbox_api::state::AppState;
use cloudbox_core::build::mock::MockBuilder;
use cloudbox_core::sandbox::mock::MockSandbox;
use cloudbox_core::sandbox::{SandboxMode, SandboxRegistry};
use cloudbox_db::store::{ExecutionStore, MemoryExecutionStore, MemoryFunctionStore};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

pub const PROJECT_ID: i64 = 7;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        base_url: "http://functions.test".to_string(),
        gateway_token: None,
    }
}

/// Engine limits tuned for fast tests.
pub fn test_engine_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        store_backend: StoreBackend::Memory,
        sandbox_mode: SandboxMode::Process,
        work_dir: dir.path().join("work"),
        artifacts_dir: dir.path().join("artifacts"),
        max_concurrent_executions: 8,
        execution_queue_timeout_ms: 1_000,
        sandbox_grace_ms: 200,
        build_concurrency: 2,
        build_timeout_secs: 60,
        build_sweep_interval_secs: 3_600,
    }
}

/// A running application on memory stores with scripted sandbox and builder.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub sandbox: Arc<MockSandbox>,
    pub builder: Arc<MockBuilder>,
    pub executions: Arc<MemoryExecutionStore>,
    services: Services,
    _dir: TempDir,
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(test_config())
}

/// Start the services and build the same router `main.rs` serves.
pub fn spawn_app_with(config: ServerConfig) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine_config(&dir);

    let sandbox = Arc::new(MockSandbox::echo());
    let builder = Arc::new(
        MockBuilder::new(&engine.artifacts_dir).with_delay(Duration::from_millis(50)),
    );
    let executions = Arc::new(MemoryExecutionStore::new());
    let stores = Stores {
        functions: Arc::new(MemoryFunctionStore::new()),
        executions: executions.clone(),
    };

    let (state, services) = services::start(
        config.clone(),
        &engine,
        stores,
        SandboxRegistry::uniform(sandbox.clone()),
        builder.clone(),
        None,
    );
    let router = build_app_router(state.clone(), &config);

    TestApp {
        router,
        state,
        sandbox,
        builder,
        executions,
        services,
        _dir: dir,
    }
}

impl TestApp {
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.send(builder.body(body).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> Response<Body> {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put_json(&self, uri: &str, body: Value) -> Response<Body> {
        self.request(Method::PUT, uri, Some(body)).await
    }

    /// Create a function in [`PROJECT_ID`] and return its JSON.
    pub async fn create_function(&self, body: Value) -> Value {
        let response = self.post_json(&functions_uri(), body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["data"].clone()
    }

    /// Create a function, deploy it and wait until it is `deployed`.
    pub async fn deployed_function(&self, body: Value) -> Value {
        let function = self.create_function(body).await;
        let id = function["id"].as_i64().unwrap();
        let response = self.request(Method::POST, &function_uri(id, "/deploy"), None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        self.wait_for_status(id, "deployed").await
    }

    /// Poll the function until it reaches `status` (5s budget).
    pub async fn wait_for_status(&self, id: i64, status: &str) -> Value {
        for _ in 0..250 {
            let function = body_json(self.get(&function_uri(id, "")).await).await["data"].clone();
            if function["status"] == status {
                return function;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("function {id} never reached status {status}");
    }

    /// Number of ledger rows for a function after flushing the writer.
    pub async fn execution_count(&self, id: i64) -> i64 {
        self.state.ledger.flush().await;
        self.executions.count_by_function(PROJECT_ID, id).await.unwrap()
    }

    pub async fn shutdown(self) {
        self.services.shutdown(Duration::from_secs(5)).await;
    }
}

pub fn functions_uri() -> String {
    format!("/api/v1/projects/{PROJECT_ID}/functions")
}

pub fn function_uri(id: i64, suffix: &str) -> String {
    format!("/api/v1/projects/{PROJECT_ID}/functions/{id}{suffix}")
}

pub fn public_uri(name: &str) -> String {
    format!("/p/{PROJECT_ID}/functions/{name}")
}

/// A minimal valid definition.
pub fn function_body(name: &str) -> Value {
    json!({
        "name": name,
        "runtime": "nodejs18",
        "code": "exports.handler = async (event) => ({ ok: true, event });",
    })
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap()
}

pub fn bearer(token: &str) -> (axum::http::HeaderName, String) {
    (AUTHORIZATION, format!("Bearer {token}"))
}
