//! Wiring of the function engine services.
//!
//! [`start`] builds the registry, pipeline, engine and ledger around the
//! given stores and providers, spawns their background tasks and returns
//! the [`AppState`] plus a [`Services`] handle used to drain them on
//! shutdown. Both `main.rs` and the integration tests go through here.

use std::sync::Arc;
use std::time::Duration;

use cloudbox_core::build::ArtifactBuilder;
use cloudbox_core::sandbox::SandboxRegistry;
use cloudbox_db::store::{ExecutionStore, FunctionStore};
use cloudbox_events::{EventBus, EventLogger};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::background::build_sweeper;
use crate::config::{EngineConfig, ServerConfig};
use crate::functions::{
    BuildWorker, DeployPipeline, EngineLimits, ExecutionEngine, ExecutionLedger, FunctionRegistry,
};
use crate::state::AppState;

/// Storage backends the services run on.
#[derive(Clone)]
pub struct Stores {
    pub functions: Arc<dyn FunctionStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

/// Handles to the background tasks started by [`start`].
pub struct Services {
    cancel: CancellationToken,
    logger_cancel: CancellationToken,
    ledger: ExecutionLedger,
    ledger_writer: JoinHandle<()>,
    build_worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    event_logger: JoinHandle<()>,
}

/// Build the application state and spawn the background tasks.
pub fn start(
    server: ServerConfig,
    engine: &EngineConfig,
    stores: Stores,
    sandboxes: SandboxRegistry,
    builder: Arc<dyn ArtifactBuilder>,
    pool: Option<cloudbox_db::DbPool>,
) -> (AppState, Services) {
    let cancel = CancellationToken::new();
    let event_bus = Arc::new(EventBus::default());

    let logger_cancel = CancellationToken::new();
    let event_logger = tokio::spawn(EventLogger::run(event_bus.subscribe(), logger_cancel.clone()));

    let (ledger, ledger_writer) = ExecutionLedger::start(Arc::clone(&stores.executions));

    let registry = Arc::new(FunctionRegistry::new(
        Arc::clone(&stores.functions),
        Arc::clone(&event_bus),
        server.base_url.clone(),
        engine.artifacts_dir.clone(),
    ));

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(DeployPipeline::new(
        Arc::clone(&stores.functions),
        jobs_tx,
        Arc::clone(&event_bus),
    ));
    let worker = Arc::new(BuildWorker::new(
        Arc::clone(&stores.functions),
        builder,
        Arc::clone(&event_bus),
        engine.artifacts_dir.clone(),
        engine.build_concurrency,
    ));
    let build_worker = tokio::spawn(worker.run(jobs_rx, cancel.child_token()));

    let sweeper = tokio::spawn(build_sweeper::run(
        Arc::clone(&stores.functions),
        Arc::clone(&event_bus),
        engine.build_timeout(),
        engine.build_sweep_interval(),
        cancel.child_token(),
    ));

    let execution_engine = Arc::new(ExecutionEngine::new(
        sandboxes,
        ledger.clone(),
        EngineLimits {
            max_concurrent: engine.max_concurrent_executions,
            queue_timeout: engine.execution_queue_timeout(),
            grace: engine.sandbox_grace(),
        },
    ));

    tracing::info!(
        max_concurrent_executions = engine.max_concurrent_executions,
        build_concurrency = engine.build_concurrency,
        "Function engine services started"
    );

    let state = AppState {
        pool,
        config: Arc::new(server),
        registry,
        engine: execution_engine,
        ledger: ledger.clone(),
        pipeline,
        event_bus,
    };

    let services = Services {
        cancel,
        logger_cancel,
        ledger,
        ledger_writer,
        build_worker,
        sweeper,
        event_logger,
    };

    (state, services)
}

impl Services {
    /// Stop background tasks and wait for them, each bounded by `timeout`.
    ///
    /// Running builds are cancelled and recorded as failed; every ledger
    /// row recorded before this call is written.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();

        if tokio::time::timeout(timeout, self.build_worker).await.is_err() {
            tracing::warn!("Build worker did not stop in time");
        }
        let _ = tokio::time::timeout(timeout, self.sweeper).await;
        tracing::info!("Build services stopped");

        if tokio::time::timeout(timeout, self.ledger.flush()).await.is_err() {
            tracing::warn!("Execution ledger did not drain in time");
        } else {
            tracing::info!("Execution ledger drained");
        }
        // Handles held by the router may outlive this; nothing is left to write.
        drop(self.ledger);
        self.ledger_writer.abort();

        // Last, so events published while draining are still logged.
        self.logger_cancel.cancel();
        let _ = tokio::time::timeout(timeout, self.event_logger).await;
    }
}
