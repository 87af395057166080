//! Management handlers for project functions.
//!
//! Mounted under `/api/v1/projects/{project_id}/functions`; the gateway
//! token is checked by the route layer before these run.

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::Json;
use cloudbox_core::execution::{clamp_log_limit, SOURCE_HTTP};
use cloudbox_core::types::DbId;
use cloudbox_db::models::execution::FunctionExecution;
use cloudbox_db::models::function::{CreateFunction, Function, UpdateFunction};
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::functions::payload::{self, InvocationPayload};
use crate::functions::pipeline::DeployResponse;
use crate::functions::{ensure_invocable, ExecutionRequest, ExecutionResult};
use crate::query::PaginationParams;
use crate::response::DataResponse;
use crate::state::AppState;

/// Largest accepted invocation body.
pub const MAX_INVOCATION_BODY_BYTES: usize = 6 * 1024 * 1024;

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// POST /projects/{project_id}/functions
pub async fn create_function(
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
    Json(input): Json<CreateFunction>,
) -> AppResult<(StatusCode, Json<DataResponse<Function>>)> {
    let function = state.registry.create(project_id, input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: function })))
}

/// GET /projects/{project_id}/functions
pub async fn list_functions(
    State(state): State<AppState>,
    Path(project_id): Path<DbId>,
) -> AppResult<Json<DataResponse<Vec<Function>>>> {
    let functions = state.registry.list(project_id).await?;
    Ok(Json(DataResponse { data: functions }))
}

/// GET /projects/{project_id}/functions/{id}
pub async fn get_function(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
) -> AppResult<Json<DataResponse<Function>>> {
    let function = state.registry.get(project_id, id).await?;
    Ok(Json(DataResponse { data: function }))
}

/// PUT /projects/{project_id}/functions/{id}
///
/// Partial update. Changing the code bumps the version; changing any
/// build input returns the function to `draft`.
pub async fn update_function(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
    Json(input): Json<UpdateFunction>,
) -> AppResult<Json<DataResponse<Function>>> {
    let function = state.registry.update(project_id, id, input).await?;
    Ok(Json(DataResponse { data: function }))
}

/// DELETE /projects/{project_id}/functions/{id}
pub async fn delete_function(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
) -> AppResult<StatusCode> {
    state.registry.delete(project_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

/// POST /projects/{project_id}/functions/{id}/deploy
///
/// Returns 202 immediately; the build runs in the background.
pub async fn deploy_function(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
) -> AppResult<(StatusCode, Json<DataResponse<DeployResponse>>)> {
    let outcome = state.pipeline.deploy(project_id, id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: outcome.into(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Execute
// ---------------------------------------------------------------------------

/// POST /projects/{project_id}/functions/{id}/execute
///
/// Body: `{"data": ..., "headers": {...}}`, both optional. Responds 200 on
/// success, otherwise with the status carried by the result.
pub async fn execute_function(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
    request: Request<Body>,
) -> AppResult<(StatusCode, Json<DataResponse<ExecutionResult>>)> {
    let function = state.registry.get(project_id, id).await?;
    ensure_invocable(&function)?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_INVOCATION_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read request body: {e}")))?;

    let envelope = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Value>(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {e}")))?
        {
            Value::Object(map) => map,
            _ => return Err(AppError::BadRequest("Request body must be a JSON object".into())),
        }
    };
    let InvocationPayload { data, headers } =
        payload::split_envelope(envelope, Value::Object(Map::new()));

    let path = parts
        .extensions
        .get::<OriginalUri>()
        .map(|OriginalUri(uri)| uri.path().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let result = state
        .engine
        .execute(ExecutionRequest {
            function,
            data,
            headers,
            method: parts.method.to_string(),
            path,
            source: SOURCE_HTTP,
            client_ip: payload::client_ip(&parts),
            user_agent: payload::user_agent(&parts),
        })
        .await;

    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    };
    Ok((status, Json(DataResponse { data: result })))
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// GET /projects/{project_id}/functions/{id}/logs
///
/// Invocation history, newest first. `limit` defaults to 100, max 1000.
pub async fn list_executions(
    State(state): State<AppState>,
    Path((project_id, id)): Path<(DbId, DbId)>,
    Query(params): Query<PaginationParams>,
) -> AppResult<Json<DataResponse<Vec<FunctionExecution>>>> {
    let limit = clamp_log_limit(params.limit);
    let executions = state
        .ledger
        .history(project_id, id, limit, params.offset())
        .await?;
    Ok(Json(DataResponse { data: executions }))
}
