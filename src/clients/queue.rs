use async_trait::async_trait;
use aws_sdk_sqs::Client as SqsClient;

use crate::models::{Result, WorkerError};

/// One message as received from the queue. Both fields are optional on the
/// wire; the worker decides what to do with incomplete messages.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: Option<String>,
    pub receipt_handle: Option<String>,
}

/// Job source with at-least-once, possibly out-of-order delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Long-polls for up to `max_messages`, waiting at most `wait_seconds`.
    async fn receive(&self, max_messages: i32, wait_seconds: i32) -> Result<Vec<QueueMessage>>;

    /// Removes a message; after this it will not be redelivered.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

pub struct SqsJobQueue {
    client: SqsClient,
    queue_url: String,
}

impl SqsJobQueue {
    pub fn new(
        sdk_config: &aws_config::SdkConfig,
        queue_url: String,
        endpoint: Option<&str>,
    ) -> Self {
        let mut builder = aws_sdk_sqs::config::Builder::from(sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self {
            client: SqsClient::from_conf(builder.build()),
            queue_url,
        }
    }
}

#[async_trait]
impl JobQueue for SqsJobQueue {
    async fn receive(&self, max_messages: i32, wait_seconds: i32) -> Result<Vec<QueueMessage>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(format!("receive: {e}")))?;

        Ok(response
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|message| QueueMessage {
                body: message.body,
                receipt_handle: message.receipt_handle,
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WorkerError::Queue(format!("delete: {e}")))?;
        Ok(())
    }
}
