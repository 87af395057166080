//! Mock sandbox for testing.
//!
//! Simulates sandbox runs without spawning anything, so engine and API
//! tests can exercise success, failure, timeout, OOM and panic paths
//! deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::provider::{
    Artifact, CapturedLogs, OutputDocument, SandboxError, SandboxInput, SandboxOutput,
    SandboxProvider,
};
use super::teardown::Teardown;

/// What the mock does when run.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Succeed, returning the invocation `data` as the response.
    Echo,
    /// Write the given output document.
    Respond(OutputDocument),
    /// Exit with the given stdout and code without an output document.
    RawStdout { stdout: String, exit_code: i32 },
    /// Sleep, honouring cancellation, then echo.
    Sleep(Duration),
    /// Sleep without ever observing cancellation.
    IgnoreCancel(Duration),
    /// Report an out-of-memory kill.
    OutOfMemory,
    /// Fail to start.
    SpawnFailure,
    /// Panic inside the provider.
    Panic,
}

/// Scriptable [`SandboxProvider`] for tests.
///
/// Every run registers a [`Teardown`] like the real providers do, counted
/// by [`MockSandbox::cleanups`].
pub struct MockSandbox {
    behavior: Mutex<MockBehavior>,
    runs: AtomicUsize,
    cleanups: Arc<AtomicUsize>,
    last_input: Mutex<Option<SandboxInput>>,
}

impl MockSandbox {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            runs: AtomicUsize::new(0),
            cleanups: Arc::new(AtomicUsize::new(0)),
            last_input: Mutex::new(None),
        }
    }

    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    /// Succeed with `data`.
    pub fn responding(data: Value) -> Self {
        Self::new(MockBehavior::Respond(OutputDocument {
            success: true,
            data: Some(data),
            error: None,
            status_code: None,
        }))
    }

    /// Fail with a runtime error message.
    pub fn failing(message: &str) -> Self {
        Self::new(MockBehavior::Respond(OutputDocument {
            success: false,
            data: None,
            error: Some(message.to_string()),
            status_code: None,
        }))
    }

    pub fn sleeping(duration: Duration) -> Self {
        Self::new(MockBehavior::Sleep(duration))
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// Number of times `run` was entered.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Number of runs whose teardown has completed.
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn last_input(&self) -> Option<SandboxInput> {
        self.last_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn output(stdout: &str, exit_code: i32, document: Option<OutputDocument>) -> SandboxOutput {
        SandboxOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code,
            duration_ms: 1,
            peak_memory_bytes: Some(1024 * 1024),
            document,
        }
    }

    fn echo_output(input: &SandboxInput) -> SandboxOutput {
        Self::output(
            "mock run\n",
            0,
            Some(OutputDocument {
                success: true,
                data: Some(input.data.clone()),
                error: None,
                status_code: None,
            }),
        )
    }
}

#[async_trait]
impl SandboxProvider for MockSandbox {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(
        &self,
        _artifact: &Artifact,
        input: SandboxInput,
        cancel: CancellationToken,
    ) -> Result<SandboxOutput, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().unwrap_or_else(|e| e.into_inner()) = Some(input.clone());
        let behavior = self
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let cleanups = Arc::clone(&self.cleanups);
        let teardown = Teardown::new(async move {
            cleanups.fetch_add(1, Ordering::SeqCst);
        });

        let result = match behavior {
            MockBehavior::Echo => Ok(Self::echo_output(&input)),
            MockBehavior::Respond(doc) => {
                let exit_code = if doc.success { 0 } else { 1 };
                Ok(Self::output("mock run\n", exit_code, Some(doc)))
            }
            MockBehavior::RawStdout { stdout, exit_code } => {
                Ok(Self::output(&stdout, exit_code, None))
            }
            MockBehavior::Sleep(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(Self::echo_output(&input)),
                    _ = cancel.cancelled() => Err(SandboxError::Cancelled {
                        logs: CapturedLogs {
                            stdout: "sleeping\n".into(),
                            stderr: String::new(),
                        },
                    }),
                }
            }
            MockBehavior::IgnoreCancel(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Self::echo_output(&input))
            }
            MockBehavior::OutOfMemory => Err(SandboxError::OutOfMemory {
                limit_mb: input.memory_limit_mb,
                peak_bytes: Some(input.memory_limit_bytes() + 1),
                logs: CapturedLogs {
                    stdout: "allocating\n".into(),
                    stderr: "killed\n".into(),
                },
            }),
            MockBehavior::SpawnFailure => {
                Err(SandboxError::SpawnFailed("mock spawn failure".into()))
            }
            MockBehavior::Panic => panic!("mock sandbox panic"),
        };

        teardown.run().await;
        result
    }
}
