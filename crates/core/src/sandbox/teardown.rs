//! Cleanup that outlives the sandbox run owning it.
//!
//! A run registers its teardown (container removal, workspace deletion)
//! with a [`Teardown`] guard. The normal path awaits [`Teardown::run`]. If
//! the run's future is dropped first, as when the engine aborts a sandbox
//! that ignored cancellation, the guard spawns the same cleanup from `Drop`.

use std::future::Future;
use std::pin::Pin;

type Cleanup = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Guard that runs its cleanup exactly once, awaited or dropped.
pub struct Teardown {
    cleanup: Option<Cleanup>,
}

impl Teardown {
    pub fn new<F>(cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cleanup: Some(Box::pin(cleanup)),
        }
    }

    /// Run the cleanup and wait for it.
    ///
    /// The cleanup runs on its own task, so aborting the caller halfway
    /// does not interrupt it.
    pub async fn run(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            if let Err(e) = tokio::spawn(cleanup).await {
                tracing::warn!(error = %e, "Sandbox cleanup task failed");
            }
        }
    }

    /// Drop the cleanup without running it.
    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => tracing::warn!("No runtime left to run sandbox cleanup on"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
