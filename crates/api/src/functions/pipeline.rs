//! Build/deploy pipeline.
//!
//! [`DeployPipeline::deploy`] moves a function into `building` with a
//! compare-and-set on its status and enqueues a [`BuildJob`]; it never
//! waits for the build. [`BuildWorker`] consumes jobs on a bounded pool,
//! serializes builds per function with a [`KeyedLock`], and swaps the
//! finished artifact in only if the function is still building the same
//! version.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cloudbox_core::build::{prune_artifacts, ArtifactBuilder, BuildSpec};
use cloudbox_core::error::CoreError;
use cloudbox_core::functions::{self, status, BuildInputs};
use cloudbox_core::runtime;
use cloudbox_core::types::DbId;
use cloudbox_db::models::function::{BuildSuccess, Function};
use cloudbox_db::store::{BuildClaim, FunctionStore, StoreError};
use cloudbox_events::{names, EventBus, PlatformEvent};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::keyed_lock::KeyedLock;
use crate::error::{AppError, AppResult};

/// Delays between attempts to write a build result (100ms, 400ms, 1.6s).
const RESULT_WRITE_DELAYS_MS: [u64; 3] = [100, 400, 1600];

/// A queued build of one function version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildJob {
    pub function_id: DbId,
    pub version: i32,
}

/// What a deploy request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A new build was queued.
    Started { version: i32 },
    /// A build is already running; the request joined it.
    InProgress { version: i32 },
    /// The current version is already deployed.
    UpToDate { version: i32 },
}

impl DeployOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::InProgress { .. } => "in_progress",
            Self::UpToDate { .. } => "up_to_date",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Started { version } => format!("Deployment of version {version} started"),
            Self::InProgress { version } => {
                format!("Deployment of version {version} is already in progress")
            }
            Self::UpToDate { version } => format!("Version {version} is already deployed"),
        }
    }
}

/// Response body of `POST .../deploy`.
#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub status: &'static str,
    pub message: String,
    pub version: i32,
}

impl From<DeployOutcome> for DeployResponse {
    fn from(outcome: DeployOutcome) -> Self {
        let version = match outcome {
            DeployOutcome::Started { version }
            | DeployOutcome::InProgress { version }
            | DeployOutcome::UpToDate { version } => version,
        };
        Self {
            status: outcome.status(),
            message: outcome.message(),
            version,
        }
    }
}

/// Digest of the build inputs of a stored definition.
pub fn definition_digest(function: &Function) -> String {
    functions::artifact_digest(&BuildInputs {
        runtime: &function.runtime,
        language: &function.language,
        entry_point: &function.entry_point,
        code: &function.code,
        dependencies: &function.dependencies,
        commands: &function.commands,
    })
}

fn is_up_to_date(function: &Function) -> bool {
    function.status == status::DEPLOYED
        && function.deployed_version == Some(function.version)
        && function.artifact_digest.as_deref() == Some(definition_digest(function).as_str())
}

// ---------------------------------------------------------------------------
// DeployPipeline
// ---------------------------------------------------------------------------

/// Accepts deploy requests and hands them to the build workers.
pub struct DeployPipeline {
    store: Arc<dyn FunctionStore>,
    jobs: mpsc::UnboundedSender<BuildJob>,
    event_bus: Arc<EventBus>,
}

impl DeployPipeline {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        jobs: mpsc::UnboundedSender<BuildJob>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            jobs,
            event_bus,
        }
    }

    /// Request a deployment of the function's current version.
    pub async fn deploy(&self, project_id: DbId, id: DbId) -> AppResult<DeployOutcome> {
        let current = self
            .store
            .find(project_id, id)
            .await?
            .ok_or_else(|| {
                AppError::Core(CoreError::NotFound {
                    entity: "function",
                    id,
                })
            })?;

        if is_up_to_date(&current) {
            return Ok(DeployOutcome::UpToDate {
                version: current.version,
            });
        }

        let function = match self
            .store
            .begin_build(project_id, id, functions::BUILD_STARTED_LOG)
            .await?
        {
            BuildClaim::Claimed(function) => function,
            BuildClaim::AlreadyBuilding(function) => {
                tracing::debug!(function_id = id, "Deploy joined an in-flight build");
                return Ok(DeployOutcome::InProgress {
                    version: function.version,
                });
            }
            BuildClaim::NotFound => {
                return Err(AppError::Core(CoreError::NotFound {
                    entity: "function",
                    id,
                }))
            }
        };

        let job = BuildJob {
            function_id: function.id,
            version: function.version,
        };
        if self.jobs.send(job).is_err() {
            let logs = format!("{}Deployment failed: build queue is closed\n", function.build_logs);
            self.store.fail_build(function.id, function.version, &logs).await?;
            return Err(AppError::InternalError("Build queue is closed".into()));
        }

        tracing::info!(function_id = id, project_id, version = function.version, "Deployment started");
        self.event_bus.publish(
            PlatformEvent::new(names::FUNCTION_DEPLOY_STARTED)
                .for_function(project_id, id)
                .with_payload(json!({ "version": function.version })),
        );

        Ok(DeployOutcome::Started {
            version: function.version,
        })
    }
}

// ---------------------------------------------------------------------------
// BuildWorker
// ---------------------------------------------------------------------------

/// Consumes [`BuildJob`]s with at most `concurrency` builds at once.
pub struct BuildWorker {
    store: Arc<dyn FunctionStore>,
    builder: Arc<dyn ArtifactBuilder>,
    event_bus: Arc<EventBus>,
    artifacts_dir: PathBuf,
    locks: KeyedLock<DbId>,
    permits: Arc<Semaphore>,
}

impl BuildWorker {
    pub fn new(
        store: Arc<dyn FunctionStore>,
        builder: Arc<dyn ArtifactBuilder>,
        event_bus: Arc<EventBus>,
        artifacts_dir: impl Into<PathBuf>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            builder,
            event_bus,
            artifacts_dir: artifacts_dir.into(),
            locks: KeyedLock::new(),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Process jobs until the queue closes or `cancel` fires, then wait for
    /// running builds. Cancellation is forwarded to running builds.
    pub async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<BuildJob>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        tracing::info!(
            concurrency = self.permits.available_permits(),
            "Build worker started"
        );

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = Arc::clone(&self);
            let build_cancel = cancel.child_token();
            tracker.spawn(async move {
                worker.process(job, build_cancel).await;
                drop(permit);
            });
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("Build worker stopped");
    }

    /// Build one job. Holds the function's lock for the whole build.
    pub async fn process(&self, job: BuildJob, cancel: CancellationToken) {
        let _guard = self.locks.lock(job.function_id).await;

        let function = match self.store.find_by_id(job.function_id).await {
            Ok(Some(f)) => f,
            Ok(None) => {
                tracing::info!(function_id = job.function_id, "Function deleted before build, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(function_id = job.function_id, error = %e, "Failed to load function for build");
                return;
            }
        };
        if function.status != status::BUILDING || function.version != job.version {
            tracing::debug!(
                function_id = job.function_id,
                job_version = job.version,
                version = function.version,
                status = %function.status,
                "Skipping stale build job"
            );
            return;
        }

        let Some(runtime) = runtime::lookup(&function.runtime) else {
            self.record_failure(&function, job, "", &format!("Unsupported runtime '{}'", function.runtime))
                .await;
            return;
        };

        let spec = BuildSpec {
            function_id: function.id,
            version: function.version,
            runtime,
            entry_point: function.entry_point.clone(),
            code: function.code.clone(),
            dependencies: function.dependencies.clone(),
            commands: function.commands.clone(),
            digest: definition_digest(&function),
        };

        tracing::info!(function_id = function.id, version = job.version, runtime = runtime.name, "Building function");
        match self.builder.build(&spec, cancel).await {
            Ok(output) => {
                let success = BuildSuccess {
                    artifact_path: output.artifact_path.to_string_lossy().into_owned(),
                    artifact_digest: output.digest,
                    build_logs: format!("{}{}", function.build_logs, output.logs),
                    deployment_logs: functions::DEPLOYED_LOG.to_string(),
                };
                let written = with_retries("complete_build", || {
                    self.store.complete_build(function.id, job.version, &success)
                })
                .await;

                match written {
                    Ok(Some(deployed)) => {
                        tracing::info!(function_id = function.id, version = job.version, "Function deployed");
                        self.event_bus.publish(
                            PlatformEvent::new(names::FUNCTION_DEPLOYED)
                                .for_function(deployed.project_id, deployed.id)
                                .with_payload(json!({
                                    "version": job.version,
                                    "digest": deployed.artifact_digest,
                                })),
                        );
                        self.prune(&function, &output.artifact_path).await;
                    }
                    Ok(None) => {
                        tracing::info!(
                            function_id = function.id,
                            version = job.version,
                            "Function changed during build, discarding artifact"
                        );
                        discard(&output.artifact_path).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            function_id = function.id,
                            version = job.version,
                            error = %e,
                            "Failed to record finished build; the build sweeper will fail it"
                        );
                        discard(&output.artifact_path).await;
                    }
                }
            }
            Err(failure) => {
                self.record_failure(&function, job, &failure.logs, &failure.reason).await;
            }
        }
    }

    async fn record_failure(&self, function: &Function, job: BuildJob, build_output: &str, reason: &str) {
        let logs = format!("{}{build_output}Deployment failed: {reason}\n", function.build_logs);
        let written = with_retries("fail_build", || self.store.fail_build(function.id, job.version, &logs)).await;

        match written {
            Ok(Some(_)) => {
                tracing::warn!(function_id = function.id, version = job.version, %reason, "Function build failed");
                self.event_bus.publish(
                    PlatformEvent::new(names::FUNCTION_DEPLOY_FAILED)
                        .for_function(function.project_id, function.id)
                        .with_payload(json!({ "version": job.version, "reason": reason })),
                );
            }
            Ok(None) => {
                tracing::info!(function_id = function.id, version = job.version, "Function changed during failed build");
            }
            Err(e) => {
                tracing::error!(
                    function_id = function.id,
                    version = job.version,
                    error = %e,
                    "Failed to record build failure; the build sweeper will fail it"
                );
            }
        }
    }

    /// Keep the new artifact and the one it replaced.
    async fn prune(&self, previous: &Function, current: &Path) {
        let previous_path = previous.artifact_path.as_deref().map(Path::new);
        let keep: Vec<&Path> = std::iter::once(current).chain(previous_path).collect();
        match prune_artifacts(&self.artifacts_dir, previous.id, &keep).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(function_id = previous.id, removed, "Pruned old artifacts"),
            Err(e) => tracing::warn!(function_id = previous.id, error = %e, "Failed to prune old artifacts"),
        }
    }
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to discard artifact");
    }
}

/// Run a store write, retrying database errors with backoff.
async fn with_retries<T, F, Fut>(operation: &str, mut write: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    for (attempt, delay_ms) in RESULT_WRITE_DELAYS_MS.iter().enumerate() {
        match write().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(operation, attempt = attempt + 1, error = %e, "Build result write failed, retrying");
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
            }
        }
    }
    write().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use cloudbox_core::build::mock::MockBuilder;
    use cloudbox_db::models::function::{FunctionChanges, NewFunction};
    use cloudbox_db::store::MemoryFunctionStore;

    use super::*;

    struct Harness {
        store: Arc<MemoryFunctionStore>,
        builder: Arc<MockBuilder>,
        pipeline: DeployPipeline,
        worker: Arc<BuildWorker>,
        jobs: mpsc::UnboundedReceiver<BuildJob>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryFunctionStore::new());
        let builder = Arc::new(MockBuilder::new(dir.path()).with_delay(Duration::from_millis(20)));
        let bus = Arc::new(EventBus::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = DeployPipeline::new(store.clone(), tx, bus.clone());
        let worker = Arc::new(BuildWorker::new(store.clone(), builder.clone(), bus, dir.path(), 2));
        Harness {
            store,
            builder,
            pipeline,
            worker,
            jobs: rx,
            _dir: dir,
        }
    }

    async fn create(store: &MemoryFunctionStore, name: &str) -> Function {
        store
            .create(&NewFunction {
                project_id: 1,
                name: name.into(),
                description: None,
                function_url: format!("http://localhost/p/1/functions/{name}"),
                runtime: "nodejs18".into(),
                language: "javascript".into(),
                code: "exports.handler = async () => 1;".into(),
                entry_point: "index.handler".into(),
                dependencies: json!({}),
                commands: vec![],
                environment: json!({}),
                timeout_secs: 30,
                memory_mb: 128,
                is_active: true,
                is_public: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn deploy_then_build_reaches_deployed() {
        let mut h = harness();
        let f = create(&h.store, "a").await;

        let outcome = h.pipeline.deploy(1, f.id).await.unwrap();
        assert_eq!(outcome, DeployOutcome::Started { version: 1 });

        let job = h.jobs.recv().await.unwrap();
        assert_eq!(job, BuildJob { function_id: f.id, version: 1 });
        h.worker.process(job, CancellationToken::new()).await;

        let f = h.store.find_by_id(f.id).await.unwrap().unwrap();
        assert_eq!(f.status, status::DEPLOYED);
        assert_eq!(f.deployed_version, Some(1));
        assert!(f.build_logs.starts_with(functions::BUILD_STARTED_LOG));
        assert_eq!(f.deployment_logs, functions::DEPLOYED_LOG);
        assert_eq!(f.artifact_digest, Some(definition_digest(&f)));

        assert_eq!(
            h.pipeline.deploy(1, f.id).await.unwrap(),
            DeployOutcome::UpToDate { version: 1 }
        );
    }

    #[tokio::test]
    async fn second_deploy_joins_in_flight_build() {
        let mut h = harness();
        let f = create(&h.store, "b").await;

        assert_eq!(h.pipeline.deploy(1, f.id).await.unwrap().status(), "started");
        assert_eq!(h.pipeline.deploy(1, f.id).await.unwrap().status(), "in_progress");

        h.jobs.recv().await.unwrap();
        assert!(h.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_build_records_reason() {
        let mut h = harness();
        let f = create(&h.store, "c").await;
        h.builder.set_failing(true);

        h.pipeline.deploy(1, f.id).await.unwrap();
        let job = h.jobs.recv().await.unwrap();
        h.worker.process(job, CancellationToken::new()).await;

        let f = h.store.find_by_id(f.id).await.unwrap().unwrap();
        assert_eq!(f.status, status::FAILED);
        assert!(f.build_logs.ends_with("Deployment failed: mock build failure\n"));
        assert!(f.deployed_version.is_none());
    }

    #[tokio::test]
    async fn edit_during_build_discards_artifact() {
        let mut h = harness();
        let f = create(&h.store, "d").await;

        h.pipeline.deploy(1, f.id).await.unwrap();
        let job = h.jobs.recv().await.unwrap();
        let changes = FunctionChanges {
            code: Some("exports.handler = async () => 2;".into()),
            ..Default::default()
        };
        h.store.update(1, f.id, &changes).await.unwrap();

        h.worker.process(job, CancellationToken::new()).await;

        let f = h.store.find_by_id(f.id).await.unwrap().unwrap();
        assert_eq!(f.status, status::DRAFT);
        assert_eq!(f.version, 2);
        assert!(f.artifact_path.is_none());
        assert_eq!(h.builder.builds(), 0);
    }

    #[tokio::test]
    async fn worker_pool_builds_each_function_once() {
        let h = harness();
        let a = create(&h.store, "e").await;
        let b = create(&h.store, "f").await;

        let cancel = CancellationToken::new();
        let Harness {
            store,
            builder,
            pipeline,
            worker,
            jobs,
            _dir,
        } = h;
        let running = tokio::spawn(worker.run(jobs, cancel.clone()));

        let (ra, rb, ra2) = tokio::join!(pipeline.deploy(1, a.id), pipeline.deploy(1, b.id), pipeline.deploy(1, a.id));
        let started = [ra.unwrap(), rb.unwrap(), ra2.unwrap()]
            .iter()
            .filter(|o| o.status() == "started")
            .count();
        assert_eq!(started, 2);

        for _ in 0..100 {
            let a = store.find_by_id(a.id).await.unwrap().unwrap();
            let b = store.find_by_id(b.id).await.unwrap().unwrap();
            if a.status == status::DEPLOYED && b.status == status::DEPLOYED {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(builder.builds(), 2);

        drop(pipeline);
        cancel.cancel();
        running.await.unwrap();
    }
}
