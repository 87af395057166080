//! Storage interfaces used by the function engine services.
//!
//! The services depend on these traits rather than on `PgPool`, so the
//! engine can run against Postgres in production and against the
//! in-memory implementation in tests and single-node development.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use cloudbox_core::types::{DbId, Timestamp};

use crate::models::execution::{FunctionExecution, NewExecution};
use crate::models::function::{BuildSuccess, Function, FunctionChanges, NewFunction};

pub use memory::{MemoryExecutionStore, MemoryFunctionStore};
pub use postgres::{PgExecutionStore, PgFunctionStore};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness rule was violated (e.g. duplicate function name).
    #[error("{0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of trying to move a function into `building`.
#[derive(Debug, Clone)]
pub enum BuildClaim {
    /// This caller flipped the row to `building` and owns the build.
    Claimed(Function),
    /// Another build is already in flight.
    AlreadyBuilding(Function),
    NotFound,
}

/// Durable store of function definitions.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Insert a new definition. Fails with [`StoreError::Conflict`] when the
    /// name is taken in the project (case-insensitive).
    async fn create(&self, new: &NewFunction) -> Result<Function, StoreError>;

    async fn find(&self, project_id: DbId, id: DbId) -> Result<Option<Function>, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Function>, StoreError>;

    async fn find_by_name(&self, project_id: DbId, name: &str) -> Result<Option<Function>, StoreError>;

    /// All functions of a project ordered by name.
    async fn list(&self, project_id: DbId) -> Result<Vec<Function>, StoreError>;

    /// Apply `changes` atomically, bumping `version` when the code changes
    /// and resetting `status` to `draft` when the build inputs change.
    async fn update(
        &self,
        project_id: DbId,
        id: DbId,
        changes: &FunctionChanges,
    ) -> Result<Option<Function>, StoreError>;

    async fn delete(&self, project_id: DbId, id: DbId) -> Result<bool, StoreError>;

    /// Compare-and-set the row to `building` with a fresh build log.
    async fn begin_build(&self, project_id: DbId, id: DbId, initial_log: &str) -> Result<BuildClaim, StoreError>;

    /// Swap in a finished artifact if the row is still `building` at `version`.
    async fn complete_build(
        &self,
        id: DbId,
        version: i32,
        result: &BuildSuccess,
    ) -> Result<Option<Function>, StoreError>;

    /// Mark the build failed if the row is still `building` at `version`.
    async fn fail_build(&self, id: DbId, version: i32, build_logs: &str) -> Result<Option<Function>, StoreError>;

    /// Fail builds that have been running since before `started_before`,
    /// appending `message` to their build logs.
    async fn fail_stuck_builds(&self, started_before: Timestamp, message: &str) -> Result<Vec<Function>, StoreError>;
}

/// Append-only invocation ledger.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, new: &NewExecution) -> Result<FunctionExecution, StoreError>;

    /// History of one function, newest first.
    async fn list_by_function(
        &self,
        project_id: DbId,
        function_id: DbId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FunctionExecution>, StoreError>;

    async fn count_by_function(&self, project_id: DbId, function_id: DbId) -> Result<i64, StoreError>;
}
