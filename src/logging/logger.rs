//! Front door of the logging pipeline.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::batch_queue::{BatchQueue, BatchQueueConfig, FlushOptions};
use super::transformer::{LogOptions, Transformer};
use super::transport::{TransferOutcome, Transport};
use crate::domain::records::LogRecord;

const SOURCE: &str = "docgen::logging::logger";

/// Accepts log input, batches it, and hands batches to a [`Transport`].
///
/// Every batch emitted by the queue is forwarded to the transport exactly
/// once by a background task. Transfer failures are logged and dropped; they
/// never reach the caller of [`log`](Self::log).
pub struct Logger {
    transformer: Transformer,
    queue: Arc<BatchQueue<LogRecord>>,
    transport: Arc<dyn Transport>,
    forwarder: JoinHandle<()>,
}

impl Logger {
    /// Build the pipeline. Must be called inside a Tokio runtime.
    pub fn new(
        transformer: Transformer,
        queue_config: BatchQueueConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let queue = Arc::new(BatchQueue::new(queue_config));
        let mut batches = queue.subscribe();

        let forwarder = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                while let Some(batch) = batches.recv().await {
                    let outcome = transport.xfer(Some(&batch)).await;
                    report(&outcome, batch.len(), "forward");
                }
            })
        };

        Self {
            transformer,
            queue,
            transport,
            forwarder,
        }
    }

    /// Transform `message` and enqueue it. Inputs that transform to nothing
    /// are ignored.
    pub async fn log(&self, message: &Value, options: &LogOptions) {
        if let Some(record) = self.transformer.xform(message, options) {
            self.queue.push(record).await;
        }
    }

    /// Shorthand for a plain text message at `level`.
    pub async fn log_text(&self, level: &str, message: &str) {
        self.log(
            &Value::String(message.to_string()),
            &LogOptions::level(level),
        )
        .await;
    }

    /// Drain everything buffered and deliver it in a single transfer.
    pub async fn flush_immediate(&self) -> TransferOutcome {
        let batch = self
            .queue
            .flush(FlushOptions::DRAIN_ALL)
            .await
            .unwrap_or_default();
        let outcome = self.transport.xfer(Some(&batch)).await;
        report(&outcome, batch.len(), "flush_immediate");
        outcome
    }

    /// Trigger a non-blocking flush through the subscriber path.
    pub async fn flush(&self) {
        self.queue.flush(FlushOptions::SCHEDULED).await;
    }

    pub async fn pending(&self) -> usize {
        self.queue.len().await
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

fn report(outcome: &TransferOutcome, records: usize, op: &'static str) {
    if outcome.success {
        debug!(
            target = SOURCE,
            op,
            result = "ok",
            records,
            status = outcome.status.code(),
            "Log batch transferred"
        );
    } else if records > 0 {
        warn!(
            target = SOURCE,
            op,
            result = "failed",
            records,
            status = outcome.status.code(),
            "Log batch dropped after failed transfer"
        );
    }
}
