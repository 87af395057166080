//! Structured logging of lifecycle events.
//!
//! [`EventLogger`] subscribes to the [`EventBus`](crate::bus::EventBus) and
//! emits one `tracing` record per event, giving operators an audit trail of
//! deploys without a separate events table.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::{names, PlatformEvent};

/// Background service that logs every platform event.
pub struct EventLogger;

impl EventLogger {
    /// Run the logging loop until the bus closes or `cancel` fires.
    pub async fn run(mut receiver: broadcast::Receiver<PlatformEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event logger stopping");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => Self::log(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event logger lagged, some events were not logged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, event logger shutting down");
                        break;
                    }
                },
            }
        }
    }

    fn log(event: &PlatformEvent) {
        if event.event_type == names::FUNCTION_DEPLOY_FAILED {
            tracing::warn!(
                event_type = %event.event_type,
                project_id = ?event.project_id,
                function_id = ?event.function_id,
                payload = %event.payload,
                "Platform event"
            );
        } else {
            tracing::info!(
                event_type = %event.event_type,
                project_id = ?event.project_id,
                function_id = ?event.function_id,
                payload = %event.payload,
                "Platform event"
            );
        }
    }
}
