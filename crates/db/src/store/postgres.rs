//! Postgres-backed stores delegating to the repositories.

use async_trait::async_trait;
use cloudbox_core::functions::status;
use cloudbox_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use super::{BuildClaim, ExecutionStore, FunctionStore, StoreError};
use crate::models::execution::{FunctionExecution, NewExecution};
use crate::models::function::{BuildSuccess, Function, FunctionChanges, NewFunction};
use crate::repositories::{FunctionExecutionRepo, FunctionRepo};

/// How often `begin_build` retries when the row changes between the CAS
/// and the follow-up read.
const CLAIM_ATTEMPTS: usize = 3;

/// Map a unique violation on a `uq_` constraint to [`StoreError::Conflict`].
fn classify(err: sqlx::Error, conflict_message: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505")
            && db_err.constraint().is_some_and(|c| c.starts_with("uq_"))
        {
            return StoreError::Conflict(conflict_message());
        }
    }
    StoreError::Database(err)
}

fn name_taken(name: &str) -> String {
    format!("A function named '{name}' already exists in this project")
}

/// [`FunctionStore`] over the `functions` table.
#[derive(Clone)]
pub struct PgFunctionStore {
    pool: PgPool,
}

impl PgFunctionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FunctionStore for PgFunctionStore {
    async fn create(&self, new: &NewFunction) -> Result<Function, StoreError> {
        FunctionRepo::create(&self.pool, new)
            .await
            .map_err(|e| classify(e, || name_taken(&new.name)))
    }

    async fn find(&self, project_id: DbId, id: DbId) -> Result<Option<Function>, StoreError> {
        Ok(FunctionRepo::find(&self.pool, project_id, id).await?)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Function>, StoreError> {
        Ok(FunctionRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_by_name(&self, project_id: DbId, name: &str) -> Result<Option<Function>, StoreError> {
        Ok(FunctionRepo::find_by_name(&self.pool, project_id, name).await?)
    }

    async fn list(&self, project_id: DbId) -> Result<Vec<Function>, StoreError> {
        Ok(FunctionRepo::list(&self.pool, project_id).await?)
    }

    async fn update(
        &self,
        project_id: DbId,
        id: DbId,
        changes: &FunctionChanges,
    ) -> Result<Option<Function>, StoreError> {
        FunctionRepo::update(&self.pool, project_id, id, changes)
            .await
            .map_err(|e| classify(e, || name_taken(changes.name.as_deref().unwrap_or_default())))
    }

    async fn delete(&self, project_id: DbId, id: DbId) -> Result<bool, StoreError> {
        Ok(FunctionRepo::delete(&self.pool, project_id, id).await?)
    }

    async fn begin_build(&self, project_id: DbId, id: DbId, initial_log: &str) -> Result<BuildClaim, StoreError> {
        for _ in 0..CLAIM_ATTEMPTS {
            if let Some(function) = FunctionRepo::begin_build(&self.pool, project_id, id, initial_log).await? {
                return Ok(BuildClaim::Claimed(function));
            }
            match FunctionRepo::find(&self.pool, project_id, id).await? {
                None => return Ok(BuildClaim::NotFound),
                Some(f) if f.status == status::BUILDING => return Ok(BuildClaim::AlreadyBuilding(f)),
                // The build finished between the CAS and the read; try again.
                Some(_) => continue,
            }
        }
        Err(StoreError::Conflict(
            "Function changed repeatedly while starting a build".into(),
        ))
    }

    async fn complete_build(
        &self,
        id: DbId,
        version: i32,
        result: &BuildSuccess,
    ) -> Result<Option<Function>, StoreError> {
        Ok(FunctionRepo::complete_build(&self.pool, id, version, result).await?)
    }

    async fn fail_build(&self, id: DbId, version: i32, build_logs: &str) -> Result<Option<Function>, StoreError> {
        Ok(FunctionRepo::fail_build(&self.pool, id, version, build_logs).await?)
    }

    async fn fail_stuck_builds(&self, started_before: Timestamp, message: &str) -> Result<Vec<Function>, StoreError> {
        Ok(FunctionRepo::fail_stuck_builds(&self.pool, started_before, message).await?)
    }
}

/// [`ExecutionStore`] over the `function_executions` table.
#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert(&self, new: &NewExecution) -> Result<FunctionExecution, StoreError> {
        Ok(FunctionExecutionRepo::insert(&self.pool, new).await?)
    }

    async fn list_by_function(
        &self,
        project_id: DbId,
        function_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FunctionExecution>, StoreError> {
        Ok(FunctionExecutionRepo::list_by_function(&self.pool, project_id, function_id, limit, offset).await?)
    }

    async fn count_by_function(&self, project_id: DbId, function_id: DbId) -> Result<i64, StoreError> {
        Ok(FunctionExecutionRepo::count_by_function(&self.pool, project_id, function_id).await?)
    }
}
