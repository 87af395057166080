//! Function engine services: registry, deploy pipeline, execution engine
//! and the execution ledger.

pub mod engine;
pub mod keyed_lock;
pub mod ledger;
pub mod payload;
pub mod pipeline;
pub mod registry;

pub use engine::{EngineLimits, ExecutionEngine, ExecutionRequest, ExecutionResult};
pub use ledger::ExecutionLedger;
pub use pipeline::{BuildJob, BuildWorker, DeployOutcome, DeployPipeline, DeployResponse};
pub use registry::{ensure_invocable, ensure_public_invocable, FunctionRegistry};
