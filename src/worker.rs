use std::sync::Arc;
use std::time::Duration;

use crate::clients::JobQueue;
use crate::pipeline::{JobOutcome, JobPipeline};

/// Sequential consumption loop: one receive call, then every returned
/// message processed and deleted in order before the next receive. There is
/// no parallelism across messages or stages; inference blocks the loop by
/// design.
pub struct QueueWorker {
    queue: Arc<dyn JobQueue>,
    pipeline: JobPipeline,
    max_messages: i32,
    wait_seconds: i32,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: JobPipeline,
        max_messages: i32,
        wait_seconds: i32,
    ) -> Self {
        Self {
            queue,
            pipeline,
            max_messages,
            wait_seconds,
        }
    }

    /// One receive call and the full processing of everything it returned.
    /// Returns the number of messages received.
    pub async fn poll_once(&self) -> usize {
        let messages = match self.queue.receive(self.max_messages, self.wait_seconds).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::error!(error = %error, "queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                return 0;
            }
        };

        let count = messages.len();
        for message in messages {
            match message.body.as_deref() {
                Some(body) => {
                    let outcome = self.pipeline.process(body).await;
                    log_outcome(&outcome);
                }
                None => tracing::warn!("received message without a body"),
            }

            // the message leaves the queue no matter how processing went
            match message.receipt_handle.as_deref() {
                Some(receipt) => {
                    if let Err(error) = self.queue.delete(receipt).await {
                        tracing::warn!(error = %error, "failed to delete message; it will be redelivered");
                    }
                }
                None => tracing::warn!("received message without a receipt handle; cannot delete"),
            }
        }
        count
    }

    pub async fn run(&self) {
        tracing::info!(
            max_messages = self.max_messages,
            wait_seconds = self.wait_seconds,
            "worker loop started"
        );
        loop {
            self.poll_once().await;
        }
    }
}

fn log_outcome(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Rejected(error) => {
            tracing::warn!(error = %error, "job rejected");
        }
        JobOutcome::Aborted {
            prediction_id,
            error,
        } => {
            tracing::error!(prediction_id = %prediction_id, error = %error, "job aborted");
        }
        JobOutcome::Completed(report) => {
            tracing::info!(
                prediction_id = %report.prediction_id,
                detections = report.detections,
                annotated = report.predicted_image_key.is_some(),
                persisted = report.persisted,
                notified = report.notified,
                "job complete"
            );
        }
    }
}
