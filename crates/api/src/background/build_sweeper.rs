//! Periodic recovery of builds that never finished.
//!
//! A build whose worker died (process restart, lost database write) would
//! leave its function in `building` forever and block further deploys.
//! This job fails any build that has been running longer than the build
//! timeout plus a grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cloudbox_db::models::function::Function;
use cloudbox_db::store::{FunctionStore, StoreError};
use cloudbox_events::{names, EventBus, PlatformEvent};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Extra time a build gets past its timeout before it is considered lost.
const SWEEP_GRACE: Duration = Duration::from_secs(60);

/// Appended to the build log of swept builds.
pub const STUCK_BUILD_LOG: &str = "Deployment failed: build did not finish in time\n";

/// Run the stuck-build sweep loop. The first sweep runs immediately.
///
/// Runs until `cancel` is triggered.
pub async fn run(
    store: Arc<dyn FunctionStore>,
    event_bus: Arc<EventBus>,
    build_timeout: Duration,
    every: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        build_timeout_secs = build_timeout.as_secs(),
        interval_secs = every.as_secs(),
        "Build sweeper started"
    );

    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Build sweeper stopping");
                break;
            }
            _ = interval.tick() => {
                match sweep_once(store.as_ref(), &event_bus, build_timeout + SWEEP_GRACE).await {
                    Ok(0) => tracing::debug!("Build sweeper: no stuck builds"),
                    Ok(failed) => tracing::info!(failed, "Build sweeper: failed stuck builds"),
                    Err(e) => tracing::error!(error = %e, "Build sweeper: sweep failed"),
                }
            }
        }
    }
}

/// Fail builds started more than `max_age` ago. Returns how many were failed.
pub async fn sweep_once(
    store: &dyn FunctionStore,
    event_bus: &EventBus,
    max_age: Duration,
) -> Result<usize, StoreError> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::days(365));
    let cutoff = Utc::now() - max_age;

    let failed: Vec<Function> = store.fail_stuck_builds(cutoff, STUCK_BUILD_LOG).await?;
    for function in &failed {
        tracing::warn!(
            function_id = function.id,
            project_id = function.project_id,
            version = function.version,
            "Failed stuck build"
        );
        event_bus.publish(
            PlatformEvent::new(names::FUNCTION_DEPLOY_FAILED)
                .for_function(function.project_id, function.id)
                .with_payload(json!({
                    "version": function.version,
                    "reason": "build did not finish in time",
                })),
        );
    }
    Ok(failed.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
