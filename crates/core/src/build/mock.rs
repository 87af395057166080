//! Mock artifact builder for testing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::builder::{function_dir, ArtifactBuilder, BuildFailure, BuildOutput, BuildSpec};

/// Builder that only creates an empty artifact directory.
///
/// Tracks how many builds ran and the highest number that ran at the same
/// time, so tests can assert single-flight behaviour.
pub struct MockBuilder {
    artifacts_dir: PathBuf,
    delay: Duration,
    fail: AtomicBool,
    builds: AtomicUsize,
    active: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl MockBuilder {
    pub fn new(artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            delay: Duration::from_millis(10),
            fail: AtomicBool::new(false),
            builds: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Make each build take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make subsequent builds fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Builds started so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Highest number of builds observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactBuilder for MockBuilder {
    async fn build(&self, spec: &BuildSpec, cancel: CancellationToken) -> Result<BuildOutput, BuildFailure> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        let logs = format!("[build] mock build of function {} v{}\n", spec.function_id, spec.version);
        if cancelled {
            return Err(BuildFailure {
                reason: "Build cancelled".into(),
                logs,
            });
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(BuildFailure {
                reason: "mock build failure".into(),
                logs,
            });
        }

        let path = function_dir(&self.artifacts_dir, spec.function_id)
            .join(format!("v{}-mock{}", spec.version, self.builds()));
        tokio::fs::create_dir_all(&path).await.map_err(|e| BuildFailure {
            reason: e.to_string(),
            logs: logs.clone(),
        })?;

        Ok(BuildOutput {
            artifact_path: path,
            digest: spec.digest.clone(),
            logs,
        })
    }
}
