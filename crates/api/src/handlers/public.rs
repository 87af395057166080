//! Public invocation by name.
//!
//! Reached without the gateway token. Only active, public, deployed
//! functions are invocable; everything else looks like a missing function
//! or a 503, and never produces a ledger row.

use axum::body::Body;
use axum::extract::{OriginalUri, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cloudbox_core::execution::SOURCE_PUBLIC;
use cloudbox_core::types::DbId;
use serde_json::{json, Value};

use super::functions::MAX_INVOCATION_BODY_BYTES;
use crate::error::{AppError, AppResult};
use crate::functions::payload;
use crate::functions::ExecutionRequest;
use crate::state::AppState;

/// ANY /p/{project_id}/functions/{name}
///
/// Responds with the function's response JSON and status code, or with
/// `{"error", "code"}` when the invocation failed.
pub async fn invoke_public(
    State(state): State<AppState>,
    Path((project_id, name)): Path<(DbId, String)>,
    request: Request<Body>,
) -> AppResult<Response> {
    let function = state.registry.find_public(project_id, &name).await?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_INVOCATION_BODY_BYTES)
        .await
        .map_err(|e| AppError::BadRequest(format!("Failed to read request body: {e}")))?;
    let payload = payload::assemble(&parts.headers, parts.uri.query(), &body);

    let path = parts
        .extensions
        .get::<OriginalUri>()
        .map(|OriginalUri(uri)| uri.path().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let result = state
        .engine
        .execute(ExecutionRequest {
            function,
            data: payload.data,
            headers: payload.headers,
            method: parts.method.to_string(),
            path,
            source: SOURCE_PUBLIC,
            client_ip: payload::client_ip(&parts),
            user_agent: payload::user_agent(&parts),
        })
        .await;

    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if result.success {
        result.response.unwrap_or(Value::Null)
    } else {
        json!({
            "error": result.error,
            "code": result.error_code,
        })
    };
    Ok((status, Json(body)).into_response())
}
