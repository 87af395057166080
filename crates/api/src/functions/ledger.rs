//! Execution ledger writer.
//!
//! [`ExecutionLedger::record`] never waits on the database: rows go onto an
//! unbounded channel and a single background writer appends them in order.
//! A failed insert is logged and dropped; it never changes the response of
//! the invocation that produced it.

use std::sync::Arc;

use cloudbox_core::types::DbId;
use cloudbox_db::models::execution::{FunctionExecution, NewExecution};
use cloudbox_db::store::ExecutionStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::AppResult;

enum LedgerMessage {
    Record(Box<NewExecution>),
    /// Acknowledged once every earlier message has been handled.
    Flush(oneshot::Sender<()>),
}

/// Handle to the ledger. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionLedger {
    sender: mpsc::UnboundedSender<LedgerMessage>,
    store: Arc<dyn ExecutionStore>,
}

impl ExecutionLedger {
    /// Spawn the writer task.
    ///
    /// The writer exits after draining the channel once every handle has
    /// been dropped.
    pub fn start(store: Arc<dyn ExecutionStore>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_writer(Arc::clone(&store), receiver));
        (Self { sender, store }, handle)
    }

    /// Enqueue one row for persistence. Returns immediately.
    pub fn record(&self, row: NewExecution) {
        let execution_id = row.execution_id.clone();
        if self.sender.send(LedgerMessage::Record(Box::new(row))).is_err() {
            tracing::error!(%execution_id, "Execution ledger writer is gone, row dropped");
        }
    }

    /// Wait until every row recorded before this call has been written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(LedgerMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Invocation history of one function, newest first.
    pub async fn history(
        &self,
        project_id: DbId,
        function_id: DbId,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<FunctionExecution>> {
        Ok(self
            .store
            .list_by_function(project_id, function_id, limit, offset)
            .await?)
    }
}

async fn run_writer(store: Arc<dyn ExecutionStore>, mut receiver: mpsc::UnboundedReceiver<LedgerMessage>) {
    while let Some(message) = receiver.recv().await {
        match message {
            LedgerMessage::Record(row) => {
                if let Err(e) = store.insert(&row).await {
                    tracing::error!(
                        execution_id = %row.execution_id,
                        function_id = row.function_id,
                        error = %e,
                        "Failed to record function execution"
                    );
                }
            }
            LedgerMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::info!("Execution ledger writer stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
