//! Execution ledger constants.
//!
//! These must match the values written to `function_executions` and the
//! checks in `20261001000002_create_function_executions_table.sql`.

use serde::{Deserialize, Serialize};

/// Value of `function_executions.status` for a successful run.
pub const STATUS_SUCCESS: &str = "success";

/// Value of `function_executions.status` for every kind of failure.
pub const STATUS_ERROR: &str = "error";

/// Invocation arrived through the management API (`POST .../execute`).
pub const SOURCE_HTTP: &str = "http";

/// Invocation arrived through the public `/p/{project}/functions/{name}` path.
pub const SOURCE_PUBLIC: &str = "public";

/// Default page size of `GET .../logs`.
pub const DEFAULT_LOG_LIMIT: i64 = 100;

/// Hard cap on `GET .../logs` page size.
pub const MAX_LOG_LIMIT: i64 = 1000;

/// Clamp a requested history page size into `1..=MAX_LOG_LIMIT`.
pub fn clamp_log_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(l) if l > 0 => l.min(MAX_LOG_LIMIT),
        _ => DEFAULT_LOG_LIMIT,
    }
}

/// Why an invocation failed. Stored in `function_executions.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorCode {
    /// Tenant code threw, exited non-zero or produced a malformed response.
    RuntimeError,
    /// The run exceeded the function's timeout and was torn down.
    Timeout,
    /// The run exceeded the function's memory ceiling.
    OutOfMemory,
    /// No sandbox provider is registered for the function's language.
    UnsupportedRuntime,
    /// The deployed artifact is missing or does not match the definition.
    ArtifactMissing,
    /// No execution slot became free within the queue timeout.
    CapacityExhausted,
    /// Engine or sandbox infrastructure failure.
    Internal,
}

impl ExecutionErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuntimeError => "runtime_error",
            Self::Timeout => "timeout",
            Self::OutOfMemory => "out_of_memory",
            Self::UnsupportedRuntime => "unsupported_runtime",
            Self::ArtifactMissing => "artifact_missing",
            Self::CapacityExhausted => "capacity_exhausted",
            Self::Internal => "internal",
        }
    }

    /// HTTP-style status code reported when the run did not set one itself.
    pub fn default_status_code(self) -> u16 {
        match self {
            Self::Timeout => 504,
            Self::CapacityExhausted => 503,
            _ => 500,
        }
    }
}

impl std::fmt::Display for ExecutionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_limit_defaults_and_caps() {
        assert_eq!(clamp_log_limit(None), DEFAULT_LOG_LIMIT);
        assert_eq!(clamp_log_limit(Some(0)), DEFAULT_LOG_LIMIT);
        assert_eq!(clamp_log_limit(Some(-3)), DEFAULT_LOG_LIMIT);
        assert_eq!(clamp_log_limit(Some(25)), 25);
        assert_eq!(clamp_log_limit(Some(50_000)), MAX_LOG_LIMIT);
    }

    #[test]
    fn error_codes_serialize_as_snake_case() {
        let json = serde_json::to_value(ExecutionErrorCode::OutOfMemory).unwrap();
        assert_eq!(json, "out_of_memory");
        assert_eq!(ExecutionErrorCode::OutOfMemory.as_str(), "out_of_memory");
    }

    #[test]
    fn default_status_codes() {
        assert_eq!(ExecutionErrorCode::Timeout.default_status_code(), 504);
        assert_eq!(ExecutionErrorCode::CapacityExhausted.default_status_code(), 503);
        assert_eq!(ExecutionErrorCode::OutOfMemory.default_status_code(), 500);
        assert_eq!(ExecutionErrorCode::RuntimeError.default_status_code(), 500);
    }
}
