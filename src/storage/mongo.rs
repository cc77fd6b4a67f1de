use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, DateTime as BsonDateTime};
use mongodb::options::{ClientOptions, FindOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use super::ResultStore;
use crate::models::{
    BoundingBox, DetectionRecord, Result, SessionRecord, SessionSummary, WorkerError,
};

const SESSIONS: &str = "prediction_sessions";
const DETECTIONS: &str = "detection_objects";

#[derive(Debug, Serialize, Deserialize)]
struct SessionDoc {
    /// Session uid doubles as the document id, so uniqueness comes from the
    /// collection's primary index.
    #[serde(rename = "_id")]
    uid: String,
    created_at: BsonDateTime,
    original_image: String,
    predicted_image: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DetectionDoc {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    prediction_uid: String,
    label: String,
    score: f64,
    bbox: [f64; 4],
    sequence_index: u32,
}

/// Managed document-store backend; the logical queries run against
/// secondary indexes created at startup.
pub struct MongoResultStore {
    db: Database,
}

impl MongoResultStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| WorkerError::Configuration(format!("invalid MongoDB URI: {e}")))?;
        let client = Client::with_options(options)
            .map_err(|e| WorkerError::Configuration(format!("MongoDB client: {e}")))?;
        let store = Self {
            db: client.database(database),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let detections: Collection<DetectionDoc> = self.db.collection(DETECTIONS);
        for keys in [
            doc! { "prediction_uid": 1 },
            doc! { "label": 1 },
            doc! { "score": 1 },
        ] {
            let model = IndexModel::builder().keys(keys).build();
            detections
                .create_index(model, None)
                .await
                .map_err(|e| WorkerError::StorageUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    /// Resolves distinct owning uids into ordered summaries; uids without a
    /// session document drop out here.
    async fn summaries_for_uids(&self, uids: Vec<Bson>) -> Result<Vec<SessionSummary>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let sessions: Collection<SessionDoc> = self.db.collection(SESSIONS);
        let options = FindOptions::builder()
            .sort(doc! { "created_at": 1, "_id": 1 })
            .build();
        let mut cursor = sessions
            .find(doc! { "_id": { "$in": uids } }, options)
            .await
            .map_err(storage_err)?;

        let mut summaries = Vec::new();
        while let Some(session) = cursor.next().await {
            let session = session.map_err(storage_err)?;
            summaries.push(SessionSummary {
                uid: session.uid,
                created_at: session.created_at.to_chrono(),
            });
        }
        Ok(summaries)
    }
}

fn storage_err(e: mongodb::error::Error) -> WorkerError {
    WorkerError::StorageUnavailable(e.to_string())
}

/// The driver surfaces uid collisions as server error E11000.
fn session_insert_err(uid: &str, e: mongodb::error::Error) -> WorkerError {
    let message = e.to_string();
    if message.contains("E11000") || message.to_lowercase().contains("duplicate key") {
        WorkerError::DuplicateKey(uid.to_string())
    } else {
        WorkerError::StorageUnavailable(message)
    }
}

#[async_trait]
impl ResultStore for MongoResultStore {
    async fn save_session(
        &self,
        uid: &str,
        original_image_key: &str,
        predicted_image_key: Option<&str>,
    ) -> Result<()> {
        let sessions: Collection<SessionDoc> = self.db.collection(SESSIONS);
        let document = SessionDoc {
            uid: uid.to_string(),
            created_at: BsonDateTime::now(),
            original_image: original_image_key.to_string(),
            predicted_image: predicted_image_key.map(str::to_string),
        };
        sessions
            .insert_one(&document, None)
            .await
            .map_err(|e| session_insert_err(uid, e))?;
        Ok(())
    }

    async fn save_detection(
        &self,
        prediction_uid: &str,
        label: &str,
        score: f32,
        bbox: BoundingBox,
        sequence_index: u32,
    ) -> Result<()> {
        let detections: Collection<DetectionDoc> = self.db.collection(DETECTIONS);
        let document = DetectionDoc {
            id: None,
            prediction_uid: prediction_uid.to_string(),
            label: label.to_string(),
            score: f64::from(score),
            bbox: [
                f64::from(bbox.x1),
                f64::from(bbox.y1),
                f64::from(bbox.x2),
                f64::from(bbox.y2),
            ],
            sequence_index,
        };
        detections
            .insert_one(&document, None)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get_by_uid(&self, uid: &str) -> Result<SessionRecord> {
        let sessions: Collection<SessionDoc> = self.db.collection(SESSIONS);
        let session = sessions
            .find_one(doc! { "_id": uid }, None)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| WorkerError::SessionNotFound(uid.to_string()))?;

        let detections: Collection<DetectionDoc> = self.db.collection(DETECTIONS);
        let options = FindOptions::builder()
            .sort(doc! { "sequence_index": 1 })
            .build();
        let mut cursor = detections
            .find(doc! { "prediction_uid": uid }, options)
            .await
            .map_err(storage_err)?;

        let mut records = Vec::new();
        while let Some(detection) = cursor.next().await {
            let detection = detection.map_err(storage_err)?;
            records.push(DetectionRecord {
                id: detection.id.map(|id| id.to_hex()).unwrap_or_default(),
                prediction_uid: detection.prediction_uid,
                label: detection.label,
                score: detection.score as f32,
                bbox: BoundingBox::new(
                    detection.bbox[0] as f32,
                    detection.bbox[1] as f32,
                    detection.bbox[2] as f32,
                    detection.bbox[3] as f32,
                ),
                sequence_index: detection.sequence_index,
            });
        }

        Ok(SessionRecord {
            uid: session.uid,
            created_at: session.created_at.to_chrono(),
            original_image_key: session.original_image,
            predicted_image_key: session.predicted_image,
            detections: records,
        })
    }

    async fn get_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let detections: Collection<DetectionDoc> = self.db.collection(DETECTIONS);
        let uids = detections
            .distinct("prediction_uid", doc! { "label": label }, None)
            .await
            .map_err(storage_err)?;
        self.summaries_for_uids(uids).await
    }

    async fn get_by_min_score(&self, threshold: f32) -> Result<Vec<SessionSummary>> {
        let detections: Collection<DetectionDoc> = self.db.collection(DETECTIONS);
        let uids = detections
            .distinct(
                "prediction_uid",
                doc! { "score": { "$gte": f64::from(threshold) } },
                None,
            )
            .await
            .map_err(storage_err)?;
        self.summaries_for_uids(uids).await
    }
}
