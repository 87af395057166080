//! Execution ledger models.
//!
//! Models for the append-only `function_executions` table.

use serde::Serialize;
use sqlx::FromRow;
use cloudbox_core::types::{DbId, Timestamp};

/// One recorded invocation attempt.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FunctionExecution {
    pub id: DbId,
    pub execution_id: String,
    pub function_id: DbId,
    pub project_id: DbId,
    pub function_version: i32,
    pub request_data: Option<serde_json::Value>,
    pub headers: serde_json::Value,
    pub method: String,
    pub path: String,
    pub source: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub status_code: i32,
    pub response_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub logs: String,
    pub execution_time_ms: i64,
    pub memory_usage_bytes: Option<i64>,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub created_at: Timestamp,
}

/// DTO for appending a ledger row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub execution_id: String,
    pub function_id: DbId,
    pub project_id: DbId,
    pub function_version: i32,
    pub request_data: Option<serde_json::Value>,
    pub headers: serde_json::Value,
    pub method: String,
    pub path: String,
    pub source: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub status_code: i32,
    pub response_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub logs: String,
    pub execution_time_ms: i64,
    pub memory_usage_bytes: Option<i64>,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
}
