pub mod mongo;
pub mod sqlite;

pub use mongo::MongoResultStore;
pub use sqlite::SqliteResultStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::models::{BoundingBox, Result, SessionRecord, SessionSummary, WorkerError};

/// Persistence contract shared by the embedded and managed backends.
///
/// Both implementations must produce identical results for identical inputs;
/// which one runs is a deployment choice fixed at startup. Sessions and
/// detections are written once and never mutated or deleted. The list
/// queries return distinct sessions ordered by `(created_at, uid)`.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Writes exactly one session row. Fails with
    /// [`WorkerError::DuplicateKey`] when `uid` already exists.
    async fn save_session(
        &self,
        uid: &str,
        original_image_key: &str,
        predicted_image_key: Option<&str>,
    ) -> Result<()>;

    /// Appends one detection. The owning session row is a logical, not
    /// physical, relationship: it does not have to exist first.
    async fn save_detection(
        &self,
        prediction_uid: &str,
        label: &str,
        score: f32,
        bbox: BoundingBox,
        sequence_index: u32,
    ) -> Result<()>;

    /// Returns the session plus its detections ordered by `sequence_index`,
    /// or [`WorkerError::SessionNotFound`].
    async fn get_by_uid(&self, uid: &str) -> Result<SessionRecord>;

    /// Sessions having at least one detection with exactly this label.
    async fn get_by_label(&self, label: &str) -> Result<Vec<SessionSummary>>;

    /// Sessions having at least one detection with `score >= threshold`.
    async fn get_by_min_score(&self, threshold: f32) -> Result<Vec<SessionSummary>>;
}

/// Builds the backend named by `STORAGE_BACKEND`; selected once at startup.
pub async fn build_result_store(cfg: &Config) -> Result<Arc<dyn ResultStore>> {
    match cfg.storage_backend.as_str() {
        "mongodb" => {
            tracing::info!(database = %cfg.database_name, "using MongoDB result store");
            let store = MongoResultStore::connect(&cfg.mongodb_uri, &cfg.database_name).await?;
            Ok(Arc::new(store))
        }
        "sqlite" => {
            tracing::info!(path = %cfg.sqlite_path, "using SQLite result store");
            let store = SqliteResultStore::open(&cfg.sqlite_path)?;
            Ok(Arc::new(store))
        }
        other => Err(WorkerError::Configuration(format!(
            "unknown storage backend: {other} (expected \"sqlite\" or \"mongodb\")"
        ))),
    }
}
