//! Execution engine.
//!
//! Runs one invocation end to end: waits for an execution slot, resolves
//! the provider and artifact, runs the sandbox under the function's timeout
//! and memory ceiling, interprets the output and records a ledger row.
//! The slot wait is part of the timeout, so a call never blocks for longer
//! than the function's timeout plus the sandbox grace period.
//! [`ExecutionEngine::execute`] never fails: every problem becomes an
//! unsuccessful [`ExecutionResult`] with an error code.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use cloudbox_core::execution::{ExecutionErrorCode, STATUS_ERROR, STATUS_SUCCESS};
use cloudbox_core::runtime;
use cloudbox_core::sandbox::{
    Artifact, SandboxError, SandboxInput, SandboxOutput, SandboxRegistry,
};
use cloudbox_db::models::execution::NewExecution;
use cloudbox_db::models::function::Function;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ledger::ExecutionLedger;

/// One invocation of a function that already passed its preconditions.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub function: Function,
    pub data: Value,
    pub headers: Value,
    pub method: String,
    pub path: String,
    /// `http` or `public`.
    pub source: &'static str,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Outcome of one invocation, as returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub function_version: i32,
    pub success: bool,
    pub response: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ExecutionErrorCode>,
    pub status_code: u16,
    pub execution_time_ms: u64,
    pub memory_usage_bytes: Option<u64>,
    pub logs: String,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub max_concurrent: usize,
    pub queue_timeout: Duration,
    /// How long a cancelled sandbox may take to stop.
    pub grace: Duration,
}

#[derive(Debug)]
struct Failure {
    code: ExecutionErrorCode,
    message: String,
    status_code: u16,
}

impl Failure {
    fn new(code: ExecutionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status_code: code.default_status_code(),
        }
    }
}

/// What happened in the sandbox, before it is turned into a result.
#[derive(Debug)]
struct Outcome {
    result: Result<(Value, u16), Failure>,
    logs: String,
    peak_memory_bytes: Option<u64>,
}

impl Outcome {
    fn failed(failure: Failure) -> Self {
        Self {
            result: Err(failure),
            logs: String::new(),
            peak_memory_bytes: None,
        }
    }
}

pub struct ExecutionEngine {
    sandboxes: SandboxRegistry,
    ledger: ExecutionLedger,
    permits: Arc<Semaphore>,
    limits: EngineLimits,
}

impl ExecutionEngine {
    pub fn new(sandboxes: SandboxRegistry, ledger: ExecutionLedger, limits: EngineLimits) -> Self {
        Self {
            sandboxes,
            ledger,
            permits: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            limits,
        }
    }

    /// Execution slots currently free.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one invocation and record it in the ledger.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        let outcome = self.run(&request).await;

        let execution_time_ms = clock.elapsed().as_millis() as u64;
        let completed_at = Utc::now();
        let function = &request.function;

        let result = match outcome.result {
            Ok((response, status_code)) => ExecutionResult {
                execution_id,
                function_version: function.version,
                success: true,
                response: Some(response),
                error: None,
                error_code: None,
                status_code,
                execution_time_ms,
                memory_usage_bytes: outcome.peak_memory_bytes,
                logs: outcome.logs,
            },
            Err(failure) => ExecutionResult {
                execution_id,
                function_version: function.version,
                success: false,
                response: None,
                error: Some(failure.message),
                error_code: Some(failure.code),
                status_code: failure.status_code,
                execution_time_ms,
                memory_usage_bytes: outcome.peak_memory_bytes,
                logs: outcome.logs,
            },
        };

        if result.success {
            tracing::info!(
                execution_id = %result.execution_id,
                function_id = function.id,
                version = function.version,
                status_code = result.status_code,
                duration_ms = execution_time_ms,
                "Function executed"
            );
        } else {
            tracing::warn!(
                execution_id = %result.execution_id,
                function_id = function.id,
                version = function.version,
                error_code = ?result.error_code,
                status_code = result.status_code,
                duration_ms = execution_time_ms,
                "Function execution failed"
            );
        }

        self.ledger.record(NewExecution {
            execution_id: result.execution_id.clone(),
            function_id: function.id,
            project_id: function.project_id,
            function_version: function.version,
            request_data: Some(request.data),
            headers: request.headers,
            method: request.method,
            path: request.path,
            source: request.source.to_string(),
            client_ip: request.client_ip,
            user_agent: request.user_agent,
            status: if result.success { STATUS_SUCCESS } else { STATUS_ERROR }.to_string(),
            status_code: i32::from(result.status_code),
            response_data: result.response.clone(),
            error_message: result.error.clone(),
            error_code: result.error_code.map(|c| c.as_str().to_string()),
            logs: result.logs.clone(),
            execution_time_ms: execution_time_ms as i64,
            memory_usage_bytes: result.memory_usage_bytes.map(|b| b as i64),
            started_at,
            completed_at,
        });

        result
    }

    async fn run(&self, request: &ExecutionRequest) -> Outcome {
        let function = &request.function;
        let timeout = Duration::from_secs(function.timeout_secs.max(1) as u64);
        let queued = Instant::now();

        let _permit = match tokio::time::timeout(
            self.limits.queue_timeout.min(timeout),
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Outcome::failed(Failure::new(
                    ExecutionErrorCode::Internal,
                    "Execution engine is shutting down",
                ))
            }
            Err(_) => {
                return Outcome::failed(Failure::new(
                    ExecutionErrorCode::CapacityExhausted,
                    "Execution capacity exhausted, try again later",
                ))
            }
        };

        let Some(spec) = runtime::lookup(&function.runtime) else {
            return Outcome::failed(Failure::new(
                ExecutionErrorCode::UnsupportedRuntime,
                format!("Unsupported runtime '{}'", function.runtime),
            ));
        };
        let Some(provider) = self.sandboxes.resolve(spec.language) else {
            return Outcome::failed(Failure::new(
                ExecutionErrorCode::UnsupportedRuntime,
                format!("No sandbox available for runtime '{}'", spec.name),
            ));
        };

        let artifact_path = match (&function.artifact_path, function.deployed_version) {
            (Some(path), Some(v)) if v == function.version => PathBuf::from(path),
            _ => {
                return Outcome::failed(Failure::new(
                    ExecutionErrorCode::ArtifactMissing,
                    format!("No deployed artifact for version {}", function.version),
                ))
            }
        };
        let artifact = Artifact {
            function_id: function.id,
            version: function.version,
            path: artifact_path,
            runtime: spec,
            entry_point: function.entry_point.clone(),
        };

        // Time spent waiting for a slot counts against the function's timeout.
        let budget = timeout.saturating_sub(queued.elapsed());
        let input = SandboxInput {
            data: request.data.clone(),
            headers: request.headers.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            env_vars: function.env_vars(),
            timeout: budget,
            memory_limit_mb: function.memory_mb.max(1) as u32,
        };

        let cancel = CancellationToken::new();
        // Dropping the caller's future tears the sandbox down as well.
        let _cancel_on_drop = cancel.clone().drop_guard();

        let token = cancel.clone();
        let mut handle = tokio::spawn(async move { provider.run(&artifact, input, token).await });

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(Ok(output))) => interpret(output),
            Ok(Ok(Err(err))) => from_sandbox_error(err, function),
            Ok(Err(join_err)) => {
                tracing::error!(function_id = function.id, error = %join_err, "Sandbox task panicked");
                Outcome::failed(Failure::new(
                    ExecutionErrorCode::Internal,
                    "Internal error while executing function",
                ))
            }
            Err(_) => {
                cancel.cancel();
                let logs = match tokio::time::timeout(self.limits.grace, &mut handle).await {
                    Ok(Ok(Ok(output))) => output.logs().combined(),
                    Ok(Ok(Err(err))) => err.logs().map(|l| l.combined()).unwrap_or_default(),
                    Ok(Err(_)) => String::new(),
                    Err(_) => {
                        tracing::warn!(
                            function_id = function.id,
                            grace_ms = self.limits.grace.as_millis() as u64,
                            "Sandbox did not stop within the grace period, abandoning it"
                        );
                        // The provider's teardown guards finish cleanup on their own tasks.
                        handle.abort();
                        String::new()
                    }
                };
                Outcome {
                    result: Err(Failure::new(
                        ExecutionErrorCode::Timeout,
                        format!("Function execution timed out after {}s", timeout.as_secs()),
                    )),
                    logs,
                    peak_memory_bytes: None,
                }
            }
        }
    }
}

/// Turn a finished sandbox run into a response or a runtime error.
fn interpret(output: SandboxOutput) -> Outcome {
    let logs = output.logs().combined();
    let peak_memory_bytes = output.peak_memory_bytes;

    let result = match output.document {
        Some(doc) if doc.success => {
            let status = doc
                .status_code
                .filter(|c| (100..=599).contains(c))
                .unwrap_or(200);
            Ok((doc.data.unwrap_or(Value::Null), status))
        }
        Some(doc) => {
            let mut failure = Failure::new(
                ExecutionErrorCode::RuntimeError,
                doc.error.unwrap_or_else(|| "Function returned an error".to_string()),
            );
            if let Some(code) = doc.status_code.filter(|c| (400..=599).contains(c)) {
                failure.status_code = code;
            }
            Err(failure)
        }
        None if output.exit_code == 0 => Ok((json!({ "output": output.stdout }), 200)),
        None => Err(Failure::new(
            ExecutionErrorCode::RuntimeError,
            format!(
                "Malformed response: function exited with code {} without writing a result",
                output.exit_code
            ),
        )),
    };

    Outcome {
        result,
        logs,
        peak_memory_bytes,
    }
}

fn from_sandbox_error(err: SandboxError, function: &Function) -> Outcome {
    let logs = err.logs().map(|l| l.combined()).unwrap_or_default();
    let mut peak_memory_bytes = None;

    let failure = match err {
        SandboxError::OutOfMemory {
            limit_mb,
            peak_bytes,
            ..
        } => {
            peak_memory_bytes = peak_bytes;
            Failure::new(
                ExecutionErrorCode::OutOfMemory,
                format!("Function exceeded its memory limit of {limit_mb} MB"),
            )
        }
        SandboxError::DeadlineExceeded { .. } => Failure::new(
            ExecutionErrorCode::Timeout,
            format!("Function execution timed out after {}s", function.timeout_secs),
        ),
        SandboxError::ArtifactMissing(detail) => {
            tracing::error!(function_id = function.id, %detail, "Deployed artifact is missing");
            Failure::new(
                ExecutionErrorCode::ArtifactMissing,
                "Deployed artifact is missing, redeploy the function",
            )
        }
        SandboxError::UnsupportedRuntime(runtime) => Failure::new(
            ExecutionErrorCode::UnsupportedRuntime,
            format!("Unsupported runtime '{runtime}'"),
        ),
        other => {
            tracing::error!(function_id = function.id, error = %other, "Sandbox failure");
            Failure::new(
                ExecutionErrorCode::Internal,
                "Internal error while executing function",
            )
        }
    };

    Outcome {
        result: Err(failure),
        logs,
        peak_memory_bytes,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
