use std::time::Duration;

use reqwest::Client;

use crate::models::{CallbackPayload, Result, WorkerError};

/// Best-effort completion notifier: one POST per job, bounded timeout,
/// never retried. Delivery outcome is for logging only and must not feed
/// back into message acknowledgment.
#[derive(Clone)]
pub struct CallbackNotifier {
    client: Client,
}

impl CallbackNotifier {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| WorkerError::Configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| WorkerError::Notify(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::Notify(format!(
                "{url}: status={} body={}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        tracing::info!(url = %url, status = status.as_u16(), "callback delivered");
        Ok(())
    }
}
