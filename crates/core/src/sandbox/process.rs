//! Native process sandbox.
//!
//! Runs the artifact's runner directly on the host with a cleared
//! environment, a throwaway workspace directory per invocation and the
//! memory/cancellation enforcement from [`subprocess::run_command`]. The
//! host must have the language toolchains installed.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::provider::{
    Artifact, CapturedLogs, OutputDocument, SandboxError, SandboxInput, SandboxOutput,
    SandboxProvider,
};
use super::subprocess::{self, ProcessLimits};
use super::teardown::Teardown;
use super::wrapper;

/// Sandbox that runs functions as host processes.
pub struct ProcessSandbox {
    work_dir: PathBuf,
}

impl ProcessSandbox {
    /// `work_dir` holds the per-invocation workspaces.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl SandboxProvider for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        artifact: &Artifact,
        input: SandboxInput,
        cancel: CancellationToken,
    ) -> Result<SandboxOutput, SandboxError> {
        let function_dir = tokio::fs::canonicalize(&artifact.path)
            .await
            .map_err(|_| SandboxError::ArtifactMissing(artifact.path.display().to_string()))?;

        let workspace = Workspace::create(&self.work_dir).await?;
        let result = run_in_workspace(&function_dir, workspace.path(), artifact, &input, &cancel).await;
        workspace.remove().await;
        result
    }
}

async fn run_in_workspace(
    function_dir: &Path,
    workspace: &Path,
    artifact: &Artifact,
    input: &SandboxInput,
    cancel: &CancellationToken,
) -> Result<SandboxOutput, SandboxError> {
    let document = serde_json::to_vec(&input.document()).unwrap_or_default();
    tokio::fs::write(workspace.join(wrapper::INPUT_FILE), &document).await?;

    let language = artifact.runtime.language;
    let launch = wrapper::launch_command(
        language,
        &function_dir.to_string_lossy(),
        &workspace.to_string_lossy(),
        &artifact.entry_point,
        input.memory_limit_mb,
    );

    let mut cmd = Command::new(&launch.program);
    cmd.args(&launch.args).current_dir(workspace);
    subprocess::isolate_env(&mut cmd, workspace);
    for (key, value) in &input.env_vars {
        cmd.env(key, value);
    }
    for (key, value) in &launch.env {
        cmd.env(key, value);
    }

    let limits = ProcessLimits {
        memory_limit_bytes: Some(input.memory_limit_bytes()),
        deadline: None,
    };
    let out = subprocess::run_command(&mut cmd, Some(document), limits, cancel).await?;

    if wrapper::reports_out_of_memory(language, out.exit_code, &out.stderr) {
        return Err(SandboxError::OutOfMemory {
            limit_mb: input.memory_limit_mb,
            peak_bytes: out.peak_memory_bytes,
            logs: CapturedLogs {
                stdout: out.stdout,
                stderr: out.stderr,
            },
        });
    }

    let document = tokio::fs::read_to_string(workspace.join(wrapper::OUTPUT_FILE))
        .await
        .ok()
        .and_then(|raw| OutputDocument::parse(&raw));

    Ok(SandboxOutput {
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
        duration_ms: out.duration_ms,
        peak_memory_bytes: out.peak_memory_bytes,
        document,
    })
}

/// Scratch directory for one invocation, removed after the run.
///
/// Removal is guarded by a [`Teardown`], so the directory is deleted even
/// when the run is dropped before reaching [`Workspace::remove`].
pub(crate) struct Workspace {
    path: PathBuf,
    teardown: Teardown,
}

impl Workspace {
    pub(crate) async fn create(root: &Path) -> Result<Self, SandboxError> {
        let path = root.join(format!("exec-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self {
            teardown: Teardown::new(remove_dir(path.clone())),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Run `first` before the directory is deleted, under the same guard.
    pub(crate) fn cleanup_after<F>(self, first: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let target = self.path.clone();
        self.teardown.disarm();
        Self {
            path: self.path,
            teardown: Teardown::new(async move {
                first.await;
                remove_dir(target).await;
            }),
        }
    }

    pub(crate) async fn remove(self) {
        self.teardown.run().await;
    }
}

async fn remove_dir(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove sandbox workspace");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::runtime::{self, Language};

    struct Fixture {
        _root: tempfile::TempDir,
        artifact: Artifact,
        work_dir: PathBuf,
    }

    fn shell_artifact(body: &str) -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let artifact_dir = root.path().join("artifact");
        let work_dir = root.path().join("work");
        std::fs::create_dir_all(&artifact_dir).expect("artifact dir");
        std::fs::create_dir_all(&work_dir).expect("work dir");
        std::fs::write(artifact_dir.join("function.sh"), body).expect("source");
        std::fs::write(
            artifact_dir.join(wrapper::runner_file(Language::Shell)),
            wrapper::render_runner(Language::Shell, "main"),
        )
        .expect("runner");

        Fixture {
            artifact: Artifact {
                function_id: 1,
                version: 1,
                path: artifact_dir,
                runtime: runtime::lookup("bash5").expect("bash5"),
                entry_point: "main".into(),
            },
            work_dir,
            _root: root,
        }
    }

    fn input() -> SandboxInput {
        SandboxInput {
            data: json!({"name": "cloudbox"}),
            headers: json!({}),
            method: "POST".into(),
            path: "/".into(),
            env_vars: vec![("GREETING".into(), "hi".into())],
            timeout: Duration::from_secs(5),
            memory_limit_mb: 256,
        }
    }

    #[tokio::test]
    async fn entry_function_reads_invocation_on_stdin() {
        let fx = shell_artifact("main() { cat; }\n");
        let out = ProcessSandbox::new(&fx.work_dir)
            .run(&fx.artifact, input(), CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("\"name\":\"cloudbox\""));
        assert!(out.document.is_none());
    }

    #[tokio::test]
    async fn function_environment_is_applied() {
        let fx = shell_artifact("main() { echo \"$GREETING from $HOME\"; }\n");
        let out = ProcessSandbox::new(&fx.work_dir)
            .run(&fx.artifact, input(), CancellationToken::new())
            .await
            .expect("run");
        assert!(out.stdout.starts_with("hi from "));
    }

    #[tokio::test]
    async fn output_document_is_collected() {
        let fx = shell_artifact(
            "main() { echo '{\"success\":true,\"data\":42,\"statusCode\":201}' > \"$CLOUDBOX_OUTPUT\"; }\n",
        );
        let out = ProcessSandbox::new(&fx.work_dir)
            .run(&fx.artifact, input(), CancellationToken::new())
            .await
            .expect("run");
        let doc = out.document.expect("document");
        assert_eq!(doc.data, Some(json!(42)));
        assert_eq!(doc.status_code, Some(201));
    }

    #[tokio::test]
    async fn cancellation_tears_down_and_cleans_workspace() {
        let fx = shell_artifact("main() { echo working; sleep 30; }\n");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = ProcessSandbox::new(&fx.work_dir)
            .run(&fx.artifact, input(), cancel)
            .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_matches!(result, Err(SandboxError::Cancelled { logs }) if logs.stdout == "working\n");
        let leftover = std::fs::read_dir(&fx.work_dir).expect("read work dir").count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn dropped_run_still_removes_workspace() {
        let fx = shell_artifact("main() { sleep 30; }\n");
        let sandbox = Arc::new(ProcessSandbox::new(&fx.work_dir));
        let artifact = fx.artifact.clone();
        let run = {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move {
                let _ = sandbox.run(&artifact, input(), CancellationToken::new()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(std::fs::read_dir(&fx.work_dir).expect("read work dir").count(), 1);

        run.abort();
        let mut leftover = 1;
        for _ in 0..100 {
            leftover = std::fs::read_dir(&fx.work_dir).expect("read work dir").count();
            if leftover == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let mut fx = shell_artifact("main() { :; }\n");
        fx.artifact.path = fx.work_dir.join("does-not-exist");
        let result = ProcessSandbox::new(&fx.work_dir)
            .run(&fx.artifact, input(), CancellationToken::new())
            .await;
        assert_matches!(result, Err(SandboxError::ArtifactMissing(_)));
    }
}
