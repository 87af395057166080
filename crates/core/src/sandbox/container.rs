//! Container sandbox backed by the `docker` CLI.
//!
//! Each invocation runs in a fresh container from the runtime's image with
//! networking disabled, an unprivileged user, a hard memory limit, the
//! artifact mounted read-only at `/function` and a scratch workspace at
//! `/workspace`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::process::Workspace;
use super::provider::{
    Artifact, CapturedLogs, OutputDocument, SandboxError, SandboxInput, SandboxOutput,
    SandboxProvider,
};
use super::subprocess::{self, ProcessLimits};
use super::wrapper;

const FUNCTION_MOUNT: &str = "/function";
const WORKSPACE_MOUNT: &str = "/workspace";
const CONTAINER_USER: &str = "1000:1000";

/// Exit status of a container killed by SIGKILL (the kernel OOM killer).
const SIGKILL_EXIT_CODE: i32 = 137;

/// Upper bound on housekeeping `docker` calls (kill, inspect, rm).
const DOCKER_ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Sandbox that runs each invocation in its own container.
pub struct ContainerSandbox {
    work_dir: PathBuf,
    docker: String,
}

impl ContainerSandbox {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            docker: "docker".into(),
        }
    }

    /// Use a different container CLI binary (e.g. `podman`).
    pub fn with_cli(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }
}

/// Run a housekeeping `docker` command and return its trimmed stdout.
async fn admin(docker: &str, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new(docker);
    cmd.args(args).kill_on_drop(true);
    let output = tokio::time::timeout(DOCKER_ADMIN_TIMEOUT, cmd.output())
        .await
        .ok()?
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Force-remove a container, stopping it first if it still runs.
async fn remove_container(docker: String, name: String) {
    if admin(&docker, &["rm", "-f", &name]).await.is_none() {
        tracing::warn!(container = %name, "Failed to remove sandbox container");
    }
}

/// Whether a usable `docker` CLI is on the PATH.
pub async fn docker_available() -> bool {
    let mut cmd = Command::new("docker");
    cmd.arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    matches!(
        tokio::time::timeout(Duration::from_secs(5), cmd.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

/// Arguments for `docker run` (everything after the CLI binary).
pub fn run_args(
    container_name: &str,
    artifact: &Artifact,
    function_dir: &str,
    workspace_dir: &str,
    input: &SandboxInput,
) -> Vec<String> {
    let launch = wrapper::launch_command(
        artifact.runtime.language,
        FUNCTION_MOUNT,
        WORKSPACE_MOUNT,
        &artifact.entry_point,
        input.memory_limit_mb,
    );
    let memory = format!("{}m", input.memory_limit_mb);

    let mut args: Vec<String> = vec![
        "run".into(),
        "-i".into(),
        "--name".into(),
        container_name.into(),
        "--network".into(),
        "none".into(),
        "--memory".into(),
        memory.clone(),
        "--memory-swap".into(),
        memory,
        "--pids-limit".into(),
        "256".into(),
        "--user".into(),
        CONTAINER_USER.into(),
        "-v".into(),
        format!("{function_dir}:{FUNCTION_MOUNT}:ro"),
        "-v".into(),
        format!("{workspace_dir}:{WORKSPACE_MOUNT}"),
        "-w".into(),
        WORKSPACE_MOUNT.into(),
    ];
    for (key, value) in input.env_vars.iter().chain(launch.env.iter()) {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }
    args.push(artifact.runtime.image.into());
    args.push(launch.program);
    args.extend(launch.args);
    args
}

#[async_trait]
impl SandboxProvider for ContainerSandbox {
    fn name(&self) -> &'static str {
        "container"
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
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The container user does not own the host directory.
            tokio::fs::set_permissions(workspace.path(), std::fs::Permissions::from_mode(0o777))
                .await?;
        }
        let workspace_dir = tokio::fs::canonicalize(workspace.path()).await?;

        let document = serde_json::to_vec(&input.document()).unwrap_or_default();
        tokio::fs::write(workspace_dir.join(wrapper::INPUT_FILE), &document).await?;

        let name = format!("cb-{}", uuid::Uuid::new_v4());
        // The container goes with the workspace, even if this run is dropped.
        let workspace = workspace.cleanup_after(remove_container(self.docker.clone(), name.clone()));

        let mut cmd = Command::new(&self.docker);
        cmd.args(run_args(
            &name,
            artifact,
            &function_dir.to_string_lossy(),
            &workspace_dir.to_string_lossy(),
            &input,
        ));

        let result = subprocess::run_command(&mut cmd, Some(document), ProcessLimits::default(), &cancel).await;

        let result = match result {
            Err(SandboxError::Cancelled { logs }) => {
                // Killing the CLI client does not stop the container.
                admin(&self.docker, &["kill", name.as_str()]).await;
                Err(SandboxError::Cancelled { logs })
            }
            Err(e) => Err(e),
            Ok(out) => {
                let oom_killed = out.exit_code == SIGKILL_EXIT_CODE
                    && admin(&self.docker, &["inspect", "-f", "{{.State.OOMKilled}}", name.as_str()])
                        .await
                        .is_some_and(|flag| flag == "true");
                if oom_killed
                    || wrapper::reports_out_of_memory(artifact.runtime.language, out.exit_code, &out.stderr)
                {
                    Err(SandboxError::OutOfMemory {
                        limit_mb: input.memory_limit_mb,
                        peak_bytes: Some(input.memory_limit_bytes()),
                        logs: CapturedLogs {
                            stdout: out.stdout,
                            stderr: out.stderr,
                        },
                    })
                } else {
                    let document = tokio::fs::read_to_string(workspace_dir.join(wrapper::OUTPUT_FILE))
                        .await
                        .ok()
                        .and_then(|raw| OutputDocument::parse(&raw));
                    Ok(SandboxOutput {
                        stdout: out.stdout,
                        stderr: out.stderr,
                        exit_code: out.exit_code,
                        duration_ms: out.duration_ms,
                        // The sampled RSS belongs to the CLI client, not the container.
                        peak_memory_bytes: None,
                        document,
                    })
                }
            }
        };

        workspace.remove().await;
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
