//! Artifact builder.
//!
//! Turns one function version into a self-contained artifact directory:
//! tenant source, language runner, dependency manifest, installed
//! dependencies and the output of the function's setup commands.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::manifest;
use crate::runtime::{Language, RuntimeSpec};
use crate::sandbox::subprocess::{self, ProcessLimits};
use crate::sandbox::{wrapper, SandboxError};
use crate::types::DbId;

/// Metadata file written last; its presence marks a complete artifact.
pub const ARTIFACT_MANIFEST: &str = "cloudbox.json";

/// Everything needed to build one function version.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub function_id: DbId,
    pub version: i32,
    pub runtime: &'static RuntimeSpec,
    pub entry_point: String,
    pub code: String,
    pub dependencies: Value,
    pub commands: Vec<String>,
    /// Digest of the inputs above, see [`crate::functions::artifact_digest`].
    pub digest: String,
}

/// A successfully built artifact.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact_path: PathBuf,
    pub digest: String,
    pub logs: String,
}

/// A failed build with a human-readable cause.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct BuildFailure {
    pub reason: String,
    pub logs: String,
}

/// Builds artifacts from function definitions.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, spec: &BuildSpec, cancel: CancellationToken) -> Result<BuildOutput, BuildFailure>;
}

/// Accumulates `[build]` progress lines and step output.
#[derive(Debug, Default)]
struct BuildLog(String);

impl BuildLog {
    fn line(&mut self, message: impl AsRef<str>) {
        self.0.push_str("[build] ");
        self.0.push_str(message.as_ref());
        self.0.push('\n');
    }

    fn output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.0.push_str(text);
        if !text.ends_with('\n') {
            self.0.push('\n');
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> BuildFailure {
        let reason = reason.into();
        self.line(format!("FAILED: {reason}"));
        BuildFailure {
            reason,
            logs: self.0,
        }
    }
}

/// Builds artifacts on the local filesystem using host toolchains.
pub struct LocalArtifactBuilder {
    artifacts_dir: PathBuf,
    timeout: Duration,
}

impl LocalArtifactBuilder {
    /// `timeout` bounds the whole build, setup commands included.
    pub fn new(artifacts_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            timeout,
        }
    }

    async fn build_into(
        &self,
        dir: &Path,
        spec: &BuildSpec,
        log: &mut BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let started = Instant::now();
        let language = spec.runtime.language;

        log.line(format!(
            "Building function {} version {} ({}, {})",
            spec.function_id, spec.version, spec.runtime.name, language
        ));

        write_file(dir, language.source_file(), &wrapper::render_source(language, &spec.code)).await?;
        write_file(
            dir,
            wrapper::runner_file(language),
            &wrapper::render_runner(language, &spec.entry_point),
        )
        .await?;
        if let Some((file, contents)) = manifest::render(spec.runtime, spec.function_id, &spec.dependencies) {
            write_file(dir, file, &contents).await?;
            log.line(format!("Wrote {file}"));
        }

        for step in install_steps(spec) {
            self.run_step(dir, &step, started, log, cancel).await?;
        }
        for command in &spec.commands {
            let step = Step::shell(command);
            self.run_step(dir, &step, started, log, cancel).await?;
        }

        let metadata = serde_json::json!({
            "function_id": spec.function_id,
            "version": spec.version,
            "runtime": spec.runtime.name,
            "entry_point": spec.entry_point,
            "digest": spec.digest,
        });
        write_file(dir, ARTIFACT_MANIFEST, &metadata.to_string()).await?;
        log.line(format!("Build finished in {}ms", started.elapsed().as_millis()));
        Ok(())
    }

    async fn run_step(
        &self,
        dir: &Path,
        step: &Step,
        started: Instant,
        log: &mut BuildLog,
        cancel: &CancellationToken,
    ) -> Result<(), String> {
        let remaining = self.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(format!("Build timed out after {}s", self.timeout.as_secs()));
        }
        log.line(format!("$ {}", step.display));

        let mut cmd = Command::new(&step.program);
        cmd.args(&step.args).current_dir(dir);
        // Setup commands are tenant code; the server's environment holds secrets.
        subprocess::isolate_env(&mut cmd, dir);
        for (key, value) in &step.env {
            cmd.env(key, value);
        }
        let limits = ProcessLimits {
            memory_limit_bytes: None,
            deadline: Some(remaining),
        };

        match subprocess::run_command(&mut cmd, None, limits, cancel).await {
            Ok(out) => {
                log.output(&out.stdout);
                log.output(&out.stderr);
                if out.exit_code == 0 {
                    Ok(())
                } else {
                    Err(format!("`{}` exited with code {}", step.display, out.exit_code))
                }
            }
            Err(SandboxError::DeadlineExceeded { logs, .. }) => {
                log.output(&logs.combined());
                Err(format!("Build timed out after {}s", self.timeout.as_secs()))
            }
            Err(SandboxError::Cancelled { logs }) => {
                log.output(&logs.combined());
                Err("Build cancelled".to_string())
            }
            Err(e) => Err(format!("`{}` could not be started: {e}", step.display)),
        }
    }
}

#[async_trait]
impl ArtifactBuilder for LocalArtifactBuilder {
    async fn build(&self, spec: &BuildSpec, cancel: CancellationToken) -> Result<BuildOutput, BuildFailure> {
        let mut log = BuildLog::default();
        let build_id = uuid::Uuid::new_v4().simple().to_string();
        let dir = function_dir(&self.artifacts_dir, spec.function_id)
            .join(format!("v{}-{}", spec.version, &build_id[..8]));

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Err(log.fail(format!("Failed to create artifact directory: {e}")));
        }

        match self.build_into(&dir, spec, &mut log, &cancel).await {
            Ok(()) => Ok(BuildOutput {
                artifact_path: dir,
                digest: spec.digest.clone(),
                logs: log.0,
            }),
            Err(reason) => {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove failed artifact");
                }
                Err(log.fail(reason))
            }
        }
    }
}

/// One command run during a build.
struct Step {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    display: String,
}

impl Step {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            display: std::iter::once(program).chain(args.iter().copied()).collect::<Vec<_>>().join(" "),
        }
    }

    fn shell(command: &str) -> Self {
        Self {
            program: "sh".into(),
            args: vec!["-c".into(), command.to_string()],
            env: Vec::new(),
            display: command.to_string(),
        }
    }

    fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

fn install_steps(spec: &BuildSpec) -> Vec<Step> {
    let has_deps = manifest::has_dependencies(&spec.dependencies);
    match spec.runtime.language {
        Language::JavaScript if has_deps => {
            vec![Step::new("npm", &["install", "--omit=dev", "--no-audit", "--no-fund"])]
        }
        Language::Python if has_deps => vec![Step::new(
            "python3",
            &["-m", "pip", "install", "--no-cache-dir", "--target", "deps", "-r", "requirements.txt"],
        )],
        Language::Go => {
            let mut steps = Vec::new();
            if has_deps {
                steps.push(Step::new("go", &["mod", "tidy"]));
            }
            steps.push(
                Step::new("go", &["build", "-o", wrapper::GO_BINARY, "."])
                    .env("CGO_ENABLED", "0")
                    .env("GOOS", "linux"),
            );
            steps
        }
        Language::Shell => vec![Step::new("bash", &["-n", Language::Shell.source_file()])],
        _ => Vec::new(),
    }
}

async fn write_file(dir: &Path, name: &str, contents: &str) -> Result<(), String> {
    tokio::fs::write(dir.join(name), contents)
        .await
        .map_err(|e| format!("Failed to write {name}: {e}"))
}

/// Directory holding every artifact of one function.
pub fn function_dir(artifacts_dir: &Path, function_id: DbId) -> PathBuf {
    artifacts_dir.join(function_id.to_string())
}

/// Remove every artifact of `function_id` except those in `keep`.
///
/// Returns the number of artifact directories removed.
pub async fn prune_artifacts(artifacts_dir: &Path, function_id: DbId, keep: &[&Path]) -> std::io::Result<usize> {
    let dir = function_dir(artifacts_dir, function_id);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if keep.iter().any(|k| *k == path.as_path()) {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove all artifacts of a deleted function.
pub async fn remove_function_artifacts(artifacts_dir: &Path, function_id: DbId) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(function_dir(artifacts_dir, function_id)).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
