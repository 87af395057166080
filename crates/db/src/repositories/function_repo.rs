//! Repository for the `functions` table.

use cloudbox_core::functions::status;
use cloudbox_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::function::{BuildSuccess, Function, FunctionChanges, NewFunction};

/// Column list for `functions` SELECT and RETURNING clauses.
const COLUMNS: &str = "\
    id, project_id, name, description, function_url, \
    runtime, language, code, entry_point, dependencies, commands, environment, \
    timeout_secs, memory_mb, status, version, is_active, is_public, \
    build_logs, deployment_logs, build_started_at, last_deployed_at, \
    deployed_version, artifact_path, artifact_digest, \
    created_at, updated_at";

/// Provides CRUD and build-state operations for function definitions.
pub struct FunctionRepo;

impl FunctionRepo {
    /// Insert a new function in `draft` at version 1.
    pub async fn create(pool: &PgPool, dto: &NewFunction) -> Result<Function, sqlx::Error> {
        let query = format!(
            "INSERT INTO functions (\
                project_id, name, description, function_url, runtime, language, code, \
                entry_point, dependencies, commands, environment, timeout_secs, memory_mb, \
                is_active, is_public, status, version\
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, 1) \
            RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(dto.project_id)
            .bind(&dto.name)
            .bind(&dto.description)
            .bind(&dto.function_url)
            .bind(&dto.runtime)
            .bind(&dto.language)
            .bind(&dto.code)
            .bind(&dto.entry_point)
            .bind(&dto.dependencies)
            .bind(&dto.commands)
            .bind(&dto.environment)
            .bind(dto.timeout_secs)
            .bind(dto.memory_mb)
            .bind(dto.is_active)
            .bind(dto.is_public)
            .bind(status::DRAFT)
            .fetch_one(pool)
            .await
    }

    /// Find a function by ID within a project.
    pub async fn find(pool: &PgPool, project_id: DbId, id: DbId) -> Result<Option<Function>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM functions WHERE id = $1 AND project_id = $2");
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .bind(project_id)
            .fetch_optional(pool)
            .await
    }

    /// Find a function by ID regardless of project (build workers).
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Function>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM functions WHERE id = $1");
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find a function by name (case-insensitive) within a project.
    pub async fn find_by_name(
        pool: &PgPool,
        project_id: DbId,
        name: &str,
    ) -> Result<Option<Function>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM functions WHERE project_id = $1 AND lower(name) = lower($2)"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(project_id)
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    /// List a project's functions ordered by name.
    pub async fn list(pool: &PgPool, project_id: DbId) -> Result<Vec<Function>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM functions WHERE project_id = $1 ORDER BY name, id");
        sqlx::query_as::<_, Function>(&query)
            .bind(project_id)
            .fetch_all(pool)
            .await
    }

    /// Apply a partial update in one statement.
    ///
    /// Every CASE reads the pre-update row, so the version bump and the
    /// status reset are decided against the stored definition.
    pub async fn update(
        pool: &PgPool,
        project_id: DbId,
        id: DbId,
        dto: &FunctionChanges,
    ) -> Result<Option<Function>, sqlx::Error> {
        let query = format!(
            "UPDATE functions SET \
                name = COALESCE($3, name), \
                function_url = COALESCE($4, function_url), \
                description = COALESCE($5, description), \
                runtime = COALESCE($6, runtime), \
                language = COALESCE($7, language), \
                code = COALESCE($8, code), \
                entry_point = COALESCE($9, entry_point), \
                dependencies = COALESCE($10, dependencies), \
                commands = COALESCE($11, commands), \
                environment = COALESCE($12, environment), \
                timeout_secs = COALESCE($13, timeout_secs), \
                memory_mb = COALESCE($14, memory_mb), \
                is_active = COALESCE($15, is_active), \
                is_public = COALESCE($16, is_public), \
                version = CASE \
                    WHEN $8::text IS NOT NULL AND $8::text IS DISTINCT FROM code THEN version + 1 \
                    ELSE version END, \
                status = CASE \
                    WHEN ($8::text IS NOT NULL AND $8::text IS DISTINCT FROM code) \
                      OR ($6::text IS NOT NULL AND $6::text IS DISTINCT FROM runtime) \
                      OR ($7::text IS NOT NULL AND $7::text IS DISTINCT FROM language) \
                      OR ($9::text IS NOT NULL AND $9::text IS DISTINCT FROM entry_point) \
                      OR ($10::jsonb IS NOT NULL AND $10::jsonb IS DISTINCT FROM dependencies) \
                      OR ($11::text[] IS NOT NULL AND $11::text[] IS DISTINCT FROM commands) \
                    THEN '{draft}' ELSE status END \
            WHERE id = $1 AND project_id = $2 \
            RETURNING {COLUMNS}",
            draft = status::DRAFT,
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .bind(project_id)
            .bind(&dto.name)
            .bind(&dto.function_url)
            .bind(&dto.description)
            .bind(&dto.runtime)
            .bind(&dto.language)
            .bind(&dto.code)
            .bind(&dto.entry_point)
            .bind(&dto.dependencies)
            .bind(&dto.commands)
            .bind(&dto.environment)
            .bind(dto.timeout_secs)
            .bind(dto.memory_mb)
            .bind(dto.is_active)
            .bind(dto.is_public)
            .fetch_optional(pool)
            .await
    }

    /// Delete a function. Ledger rows are left untouched.
    pub async fn delete(pool: &PgPool, project_id: DbId, id: DbId) -> Result<bool, sqlx::Error> {
        let rows = sqlx::query("DELETE FROM functions WHERE id = $1 AND project_id = $2")
            .bind(id)
            .bind(project_id)
            .execute(pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Compare-and-set the function into `building`.
    ///
    /// Returns `None` when the function is missing or already building.
    pub async fn begin_build(
        pool: &PgPool,
        project_id: DbId,
        id: DbId,
        initial_log: &str,
    ) -> Result<Option<Function>, sqlx::Error> {
        let query = format!(
            "UPDATE functions SET status = $3, build_logs = $4, build_started_at = now() \
             WHERE id = $1 AND project_id = $2 AND status <> $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .bind(project_id)
            .bind(status::BUILDING)
            .bind(initial_log)
            .fetch_optional(pool)
            .await
    }

    /// Swap a finished build in, if the row still describes the built version.
    pub async fn complete_build(
        pool: &PgPool,
        id: DbId,
        version: i32,
        dto: &BuildSuccess,
    ) -> Result<Option<Function>, sqlx::Error> {
        let query = format!(
            "UPDATE functions SET \
                status = $3, deployed_version = version, \
                artifact_path = $4, artifact_digest = $5, \
                build_logs = $6, deployment_logs = $7, last_deployed_at = now() \
             WHERE id = $1 AND version = $2 AND status = $8 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .bind(version)
            .bind(status::DEPLOYED)
            .bind(&dto.artifact_path)
            .bind(&dto.artifact_digest)
            .bind(&dto.build_logs)
            .bind(&dto.deployment_logs)
            .bind(status::BUILDING)
            .fetch_optional(pool)
            .await
    }

    /// Mark a build failed, if the row still describes the built version.
    pub async fn fail_build(
        pool: &PgPool,
        id: DbId,
        version: i32,
        build_logs: &str,
    ) -> Result<Option<Function>, sqlx::Error> {
        let query = format!(
            "UPDATE functions SET status = $3, build_logs = $4 \
             WHERE id = $1 AND version = $2 AND status = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(id)
            .bind(version)
            .bind(status::FAILED)
            .bind(build_logs)
            .bind(status::BUILDING)
            .fetch_optional(pool)
            .await
    }

    /// Fail every build that started before `started_before`.
    pub async fn fail_stuck_builds(
        pool: &PgPool,
        started_before: Timestamp,
        message: &str,
    ) -> Result<Vec<Function>, sqlx::Error> {
        let query = format!(
            "UPDATE functions SET status = $2, build_logs = build_logs || $3 \
             WHERE status = $4 AND (build_started_at IS NULL OR build_started_at < $1) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Function>(&query)
            .bind(started_before)
            .bind(status::FAILED)
            .bind(message)
            .bind(status::BUILDING)
            .fetch_all(pool)
            .await
    }
}
