//! Sandbox provider interface and shared types.
//!
//! A [`SandboxProvider`] receives a built [`Artifact`] and one invocation
//! payload, runs the code in isolation and reports what happened. Providers
//! never touch the database and never decide HTTP semantics; the execution
//! engine interprets their output.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::runtime::RuntimeSpec;
use crate::types::DbId;

/// A deployed, runnable build of one function version.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub function_id: DbId,
    pub version: i32,
    /// Directory produced by the artifact builder.
    pub path: PathBuf,
    pub runtime: &'static RuntimeSpec,
    pub entry_point: String,
}

/// One invocation handed to a provider.
#[derive(Debug, Clone)]
pub struct SandboxInput {
    pub data: Value,
    pub headers: Value,
    pub method: String,
    pub path: String,
    /// Function environment, applied on top of the sandbox's minimal env.
    pub env_vars: Vec<(String, String)>,
    /// The engine enforces this through cancellation; providers may use it
    /// to size their own limits.
    pub timeout: Duration,
    pub memory_limit_mb: u32,
}

impl SandboxInput {
    /// The `input.json` document read by the language wrappers.
    pub fn document(&self) -> Value {
        serde_json::json!({
            "data": self.data,
            "headers": self.headers,
            "method": self.method,
            "path": self.path,
        })
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        u64::from(self.memory_limit_mb) * 1024 * 1024
    }
}

/// The `output.json` document written by the language wrappers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDocument {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "statusCode", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl OutputDocument {
    /// Parse wrapper output, tolerating surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw.trim()).ok()
    }
}

/// What a provider observed for a run that finished on its own.
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code (`-1` if killed by a signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    pub peak_memory_bytes: Option<u64>,
    /// `None` when the wrapper never wrote a parseable output document.
    pub document: Option<OutputDocument>,
}

impl SandboxOutput {
    pub fn logs(&self) -> CapturedLogs {
        CapturedLogs {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

/// Output captured from a run that did not complete normally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLogs {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedLogs {
    /// Stdout followed by stderr, verbatim.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Errors from sandbox providers.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The run was cancelled by the caller and torn down.
    #[error("Sandbox run cancelled")]
    Cancelled { logs: CapturedLogs },

    /// The run exceeded its memory ceiling and was killed.
    #[error("Memory limit of {limit_mb} MB exceeded")]
    OutOfMemory {
        limit_mb: u32,
        peak_bytes: Option<u64>,
        logs: CapturedLogs,
    },

    /// A run with its own deadline (build steps) exceeded it.
    #[error("Deadline of {elapsed_ms}ms exceeded")]
    DeadlineExceeded { elapsed_ms: u64, logs: CapturedLogs },

    /// The sandbox process or container could not be started.
    #[error("Failed to start sandbox: {0}")]
    SpawnFailed(String),

    /// The artifact directory does not exist or is incomplete.
    #[error("Artifact not found: {0}")]
    ArtifactMissing(String),

    /// This provider cannot run the artifact's runtime.
    #[error("Unsupported runtime: {0}")]
    UnsupportedRuntime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Output captured before the run ended, if any.
    pub fn logs(&self) -> Option<&CapturedLogs> {
        match self {
            Self::Cancelled { logs }
            | Self::OutOfMemory { logs, .. }
            | Self::DeadlineExceeded { logs, .. } => Some(logs),
            _ => None,
        }
    }
}

/// Runs built artifacts in isolation.
///
/// Implementations must stop the underlying process or container once
/// `cancel` fires and return promptly afterwards; the engine only waits a
/// short grace period before abandoning the run.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provider identifier (`process`, `container`, `mock`).
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        artifact: &Artifact,
        input: SandboxInput,
        cancel: CancellationToken,
    ) -> Result<SandboxOutput, SandboxError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn output_document_reads_status_code() {
        let doc = OutputDocument::parse(r#"{"success":true,"data":{"a":1},"statusCode":201}"#)
            .expect("parse");
        assert!(doc.success);
        assert_eq!(doc.status_code, Some(201));
        assert_eq!(doc.data, Some(json!({"a": 1})));
    }

    #[test]
    fn output_document_error_shape() {
        let doc = OutputDocument::parse("  {\"success\":false,\"error\":\"boom\"}\n").expect("parse");
        assert!(!doc.success);
        assert_eq!(doc.error.as_deref(), Some("boom"));
        assert_eq!(doc.data, None);
    }

    #[test]
    fn output_document_rejects_plain_text() {
        assert!(OutputDocument::parse("hello").is_none());
        assert!(OutputDocument::parse(r#"{"data": 1}"#).is_none());
    }

    #[test]
    fn combined_logs_keep_order() {
        let logs = CapturedLogs {
            stdout: "out".into(),
            stderr: "err\n".into(),
        };
        assert_eq!(logs.combined(), "out\nerr\n");

        let logs = CapturedLogs {
            stdout: "out\n".into(),
            stderr: String::new(),
        };
        assert_eq!(logs.combined(), "out\n");
    }

    #[test]
    fn input_document_shape() {
        let input = SandboxInput {
            data: json!({"x": 1}),
            headers: json!({"accept": "application/json"}),
            method: "POST".into(),
            path: "/p/1/functions/f".into(),
            env_vars: vec![],
            timeout: Duration::from_secs(1),
            memory_limit_mb: 64,
        };
        let doc = input.document();
        assert_eq!(doc["data"]["x"], 1);
        assert_eq!(doc["method"], "POST");
        assert_eq!(input.memory_limit_bytes(), 64 * 1024 * 1024);
    }
}
