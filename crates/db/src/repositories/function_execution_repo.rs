//! Repository for the `function_executions` table.
//!
//! Rows are only ever inserted and read.

use cloudbox_core::types::DbId;
use sqlx::PgPool;

use crate::models::execution::{FunctionExecution, NewExecution};

/// Column list for `function_executions` SELECT and RETURNING clauses.
const COLUMNS: &str = "\
    id, execution_id, function_id, project_id, function_version, \
    request_data, headers, method, path, source, client_ip, user_agent, \
    status, status_code, response_data, error_message, error_code, logs, \
    execution_time_ms, memory_usage_bytes, started_at, completed_at, created_at";

/// Provides append and history queries for the execution ledger.
pub struct FunctionExecutionRepo;

impl FunctionExecutionRepo {
    /// Append one invocation record.
    pub async fn insert(pool: &PgPool, dto: &NewExecution) -> Result<FunctionExecution, sqlx::Error> {
        let query = format!(
            "INSERT INTO function_executions (\
                execution_id, function_id, project_id, function_version, \
                request_data, headers, method, path, source, client_ip, user_agent, \
                status, status_code, response_data, error_message, error_code, logs, \
                execution_time_ms, memory_usage_bytes, started_at, completed_at\
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                      $16, $17, $18, $19, $20, $21) \
            RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, FunctionExecution>(&query)
            .bind(&dto.execution_id)
            .bind(dto.function_id)
            .bind(dto.project_id)
            .bind(dto.function_version)
            .bind(&dto.request_data)
            .bind(&dto.headers)
            .bind(&dto.method)
            .bind(&dto.path)
            .bind(&dto.source)
            .bind(&dto.client_ip)
            .bind(&dto.user_agent)
            .bind(&dto.status)
            .bind(dto.status_code)
            .bind(&dto.response_data)
            .bind(&dto.error_message)
            .bind(&dto.error_code)
            .bind(&dto.logs)
            .bind(dto.execution_time_ms)
            .bind(dto.memory_usage_bytes)
            .bind(dto.started_at)
            .bind(dto.completed_at)
            .fetch_one(pool)
            .await
    }

    /// A function's invocation history, newest first.
    pub async fn list_by_function(
        pool: &PgPool,
        project_id: DbId,
        function_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FunctionExecution>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM function_executions \
             WHERE project_id = $1 AND function_id = $2 \
             ORDER BY started_at DESC, id DESC \
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as::<_, FunctionExecution>(&query)
            .bind(project_id)
            .bind(function_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Number of recorded invocations of a function.
    pub async fn count_by_function(
        pool: &PgPool,
        project_id: DbId,
        function_id: DbId,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM function_executions WHERE project_id = $1 AND function_id = $2",
        )
        .bind(project_id)
        .bind(function_id)
        .fetch_one(pool)
        .await
    }
}
