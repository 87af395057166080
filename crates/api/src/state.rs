use std::sync::Arc;

use cloudbox_events::EventBus;

use crate::config::ServerConfig;
use crate::functions::{DeployPipeline, ExecutionEngine, ExecutionLedger, FunctionRegistry};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool; `None` when running on the memory store.
    pub pool: Option<cloudbox_db::DbPool>,
    /// Server configuration (accessed by middleware and handlers).
    pub config: Arc<ServerConfig>,
    /// Function definitions: validation, CRUD and invocation preconditions.
    pub registry: Arc<FunctionRegistry>,
    /// Runs invocations in sandboxes.
    pub engine: Arc<ExecutionEngine>,
    /// Invocation history.
    pub ledger: ExecutionLedger,
    /// Accepts deploy requests.
    pub pipeline: Arc<DeployPipeline>,
    /// Centralized event bus for publishing platform events.
    pub event_bus: Arc<EventBus>,
}
