use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clients::{BlobStore, CallbackNotifier};
use crate::inference::DetectionModel;
use crate::models::{CallbackPayload, Detection, JobMessage, Result, WorkerError};
use crate::storage::ResultStore;

/// Where a message's pipeline stopped and what it accomplished.
#[derive(Debug)]
pub enum JobOutcome {
    /// The body never decoded into a job; nothing was attempted.
    Rejected(WorkerError),
    /// A fatal stage (fetch or inference) failed; no results exist.
    Aborted {
        prediction_id: String,
        error: WorkerError,
    },
    /// The pipeline ran to completion, possibly with non-fatal losses.
    Completed(JobReport),
}

#[derive(Debug)]
pub struct JobReport {
    pub prediction_id: String,
    pub detections: usize,
    /// Blob key of the annotated artifact; `None` when annotation or its
    /// upload failed.
    pub predicted_image_key: Option<String>,
    /// False when any session or detection write was lost.
    pub persisted: bool,
    pub notified: bool,
}

/// Runs one message end to end: decode, fetch, infer, annotate and upload,
/// persist, notify. Only decode, fetch, and inference failures abort the
/// remaining stages; everything else is logged and the pipeline continues.
/// Acknowledgment is the caller's job and never depends on the outcome.
pub struct JobPipeline {
    blob: Arc<dyn BlobStore>,
    model: Arc<dyn DetectionModel>,
    store: Arc<dyn ResultStore>,
    notifier: CallbackNotifier,
    callback_base_url: Option<String>,
    upload_dir: PathBuf,
    predicted_dir: PathBuf,
}

impl JobPipeline {
    pub fn new(
        blob: Arc<dyn BlobStore>,
        model: Arc<dyn DetectionModel>,
        store: Arc<dyn ResultStore>,
        notifier: CallbackNotifier,
        callback_base_url: Option<String>,
        upload_dir: &Path,
        predicted_dir: &Path,
    ) -> Self {
        Self {
            blob,
            model,
            store,
            notifier,
            callback_base_url,
            upload_dir: upload_dir.to_path_buf(),
            predicted_dir: predicted_dir.to_path_buf(),
        }
    }

    pub async fn process(&self, body: &str) -> JobOutcome {
        // stage 1: decode
        let job = match self.decode(body) {
            Ok(job) => job,
            Err(error) => {
                tracing::warn!(error = %error, "rejecting undecodable job message");
                return JobOutcome::Rejected(error);
            }
        };
        let uid = job.prediction_id.clone();
        tracing::info!(prediction_id = %uid, image = %job.image_name, "processing job");

        // stage 2: fetch the source image and stage it locally
        let input_path = self.upload_dir.join(format!("{uid}.jpg"));
        if let Err(error) = self.fetch(&job.image_name, &input_path).await {
            tracing::error!(prediction_id = %uid, error = %error, "failed to stage source image");
            return JobOutcome::Aborted {
                prediction_id: uid,
                error,
            };
        }

        // stage 3: infer; the one failure that forfeits all remaining work
        let prediction = match self.model.run(&input_path) {
            Ok(prediction) => prediction,
            Err(error) => {
                tracing::error!(prediction_id = %uid, error = %error, "inference failed; abandoning message");
                return JobOutcome::Aborted {
                    prediction_id: uid,
                    error,
                };
            }
        };
        tracing::info!(
            prediction_id = %uid,
            detections = prediction.detections.len(),
            "inference complete"
        );

        // stage 4: annotate & upload, non-fatal
        let predicted_image_key = self
            .store_annotated_frame(&uid, prediction.annotated_frame)
            .await;

        // stage 5: persist, non-fatal
        let persisted = self
            .persist(
                &uid,
                &job.image_name,
                predicted_image_key.as_deref(),
                &prediction.detections,
            )
            .await;

        // stage 6: notify, non-fatal
        let notified = self.notify(&job).await;

        JobOutcome::Completed(JobReport {
            prediction_id: uid,
            detections: prediction.detections.len(),
            predicted_image_key,
            persisted,
            notified,
        })
    }

    /// Decode also settles the callback target: a message without a
    /// `callback_url` is only valid when a base URL is configured.
    fn decode(&self, body: &str) -> Result<JobMessage> {
        let job = JobMessage::decode(body)?;
        if job.callback_url.is_none() && self.callback_base_url.is_none() {
            return Err(WorkerError::Decode(
                "no callback_url in message and no base URL configured".to_string(),
            ));
        }
        Ok(job)
    }

    async fn fetch(&self, image_name: &str, input_path: &Path) -> Result<()> {
        let bytes = self.blob.fetch(image_name).await?;
        tokio::fs::write(input_path, &bytes).await?;
        tracing::debug!(image = %image_name, path = %input_path.display(), size_bytes = bytes.len(), "staged source image");
        Ok(())
    }

    /// Returns the artifact's blob key, or `None` when rendering, the local
    /// write, or the upload failed. Downstream stages run either way.
    async fn store_annotated_frame(
        &self,
        uid: &str,
        frame: Result<Vec<u8>>,
    ) -> Option<String> {
        let jpeg = match frame {
            Ok(jpeg) => jpeg,
            Err(error) => {
                tracing::warn!(prediction_id = %uid, error = %error, "annotation failed; continuing without artifact");
                return None;
            }
        };

        let output_path = self.predicted_dir.join(format!("{uid}.jpg"));
        if let Err(error) = tokio::fs::write(&output_path, &jpeg).await {
            tracing::warn!(prediction_id = %uid, error = %error, "failed to write annotated frame; continuing without artifact");
            return None;
        }

        let key = format!("predicted/{uid}.jpg");
        match self.blob.upload(&output_path, &key).await {
            Ok(()) => Some(key),
            Err(error) => {
                tracing::warn!(prediction_id = %uid, error = %error, "failed to upload annotated frame; continuing without artifact");
                None
            }
        }
    }

    /// Session row first, so a backend doing physical foreign-key checks
    /// sees it before the detections. Returns whether everything this run
    /// was responsible for is in the store.
    async fn persist(
        &self,
        uid: &str,
        original_image_key: &str,
        predicted_image_key: Option<&str>,
        detections: &[Detection],
    ) -> bool {
        let mut persisted = true;
        let mut write_detections = true;

        match self
            .store
            .save_session(uid, original_image_key, predicted_image_key)
            .await
        {
            Ok(()) => {}
            Err(WorkerError::DuplicateKey(_)) => {
                // redelivered message: an earlier attempt already persisted
                // this job, so re-writing detections would double them
                tracing::warn!(prediction_id = %uid, "session already persisted; skipping detection writes");
                write_detections = false;
            }
            Err(error) => {
                tracing::error!(prediction_id = %uid, error = %error, "failed to persist session");
                persisted = false;
            }
        }

        if write_detections {
            for (index, detection) in detections.iter().enumerate() {
                if let Err(error) = self
                    .store
                    .save_detection(
                        uid,
                        &detection.label,
                        detection.score,
                        detection.bbox,
                        index as u32,
                    )
                    .await
                {
                    tracing::error!(
                        prediction_id = %uid,
                        sequence_index = index,
                        error = %error,
                        "failed to persist detection"
                    );
                    persisted = false;
                }
            }
        }

        persisted
    }

    async fn notify(&self, job: &JobMessage) -> bool {
        let uid = &job.prediction_id;
        let url = match self.resolve_callback_url(job) {
            Some(url) => url,
            None => {
                // unreachable after decode's target check; kept as a guard
                tracing::warn!(prediction_id = %uid, "no callback target; skipping notification");
                return false;
            }
        };

        let payload = CallbackPayload {
            chat_id: job.chat_id.clone(),
            prediction_id: uid.clone(),
        };
        match self.notifier.notify(&url, &payload).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(prediction_id = %uid, error = %error, "callback delivery failed");
                false
            }
        }
    }

    fn resolve_callback_url(&self, job: &JobMessage) -> Option<String> {
        job.callback_url.clone().or_else(|| {
            self.callback_base_url.as_ref().map(|base| {
                format!(
                    "{}/predictions/{}",
                    base.trim_end_matches('/'),
                    job.prediction_id
                )
            })
        })
    }
}
