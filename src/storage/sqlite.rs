use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::ResultStore;
use crate::models::{
    BoundingBox, DetectionRecord, Result, SessionRecord, SessionSummary, WorkerError,
};

/// Single-file embedded backend.
///
/// The worker loop is the only writer, so one connection behind a mutex is
/// enough; no statement ever holds the lock across an await point.
pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prediction_sessions (
    uid             TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    original_image  TEXT NOT NULL,
    predicted_image TEXT
);
CREATE TABLE IF NOT EXISTS detection_objects (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    prediction_uid TEXT NOT NULL,
    label          TEXT NOT NULL,
    score          REAL NOT NULL,
    x1             REAL NOT NULL,
    y1             REAL NOT NULL,
    x2             REAL NOT NULL,
    y2             REAL NOT NULL,
    sequence_index INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detection_prediction_uid ON detection_objects (prediction_uid);
CREATE INDEX IF NOT EXISTS idx_detection_label ON detection_objects (label);
CREATE INDEX IF NOT EXISTS idx_detection_score ON detection_objects (score);
";

impl SqliteResultStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| WorkerError::StorageUnavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| WorkerError::StorageUnavailable(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn storage_err(e: rusqlite::Error) -> WorkerError {
    WorkerError::StorageUnavailable(e.to_string())
}

/// The only constraint on the insert path is the session primary key, so a
/// constraint violation means a uid collision.
fn session_insert_err(uid: &str, e: rusqlite::Error) -> WorkerError {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            WorkerError::DuplicateKey(uid.to_string())
        }
        other => storage_err(other),
    }
}

/// RFC 3339 UTC text; lexicographic order matches chronological order.
fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| WorkerError::StorageUnavailable(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save_session(
        &self,
        uid: &str,
        original_image_key: &str,
        predicted_image_key: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute(
            "INSERT INTO prediction_sessions (uid, created_at, original_image, predicted_image)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uid,
                encode_timestamp(Utc::now()),
                original_image_key,
                predicted_image_key
            ],
        )
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
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute(
            "INSERT INTO detection_objects
                 (prediction_uid, label, score, x1, y1, x2, y2, sequence_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                prediction_uid,
                label,
                f64::from(score),
                f64::from(bbox.x1),
                f64::from(bbox.y1),
                f64::from(bbox.x2),
                f64::from(bbox.y2),
                sequence_index
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get_by_uid(&self, uid: &str) -> Result<SessionRecord> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");

        let session = conn
            .query_row(
                "SELECT uid, created_at, original_image, predicted_image
                 FROM prediction_sessions WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;

        let (uid, created_at, original_image_key, predicted_image_key) =
            session.ok_or_else(|| WorkerError::SessionNotFound(uid.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, prediction_uid, label, score, x1, y1, x2, y2, sequence_index
                 FROM detection_objects WHERE prediction_uid = ?1
                 ORDER BY sequence_index",
            )
            .map_err(storage_err)?;
        let detections = stmt
            .query_map(params![uid], |row| {
                Ok(DetectionRecord {
                    id: row.get::<_, i64>(0)?.to_string(),
                    prediction_uid: row.get(1)?,
                    label: row.get(2)?,
                    score: row.get::<_, f64>(3)? as f32,
                    bbox: BoundingBox::new(
                        row.get::<_, f64>(4)? as f32,
                        row.get::<_, f64>(5)? as f32,
                        row.get::<_, f64>(6)? as f32,
                        row.get::<_, f64>(7)? as f32,
                    ),
                    sequence_index: row.get(8)?,
                })
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        Ok(SessionRecord {
            uid,
            created_at: decode_timestamp(&created_at)?,
            original_image_key,
            predicted_image_key,
            detections,
        })
    }

    async fn get_by_label(&self, label: &str) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT ps.uid, ps.created_at
                 FROM prediction_sessions ps
                 JOIN detection_objects d ON ps.uid = d.prediction_uid
                 WHERE d.label = ?1
                 ORDER BY ps.created_at, ps.uid",
            )
            .map_err(storage_err)?;
        let summaries =
            collect_summaries(stmt.query_map(params![label], summary_row).map_err(storage_err)?);
        summaries
    }

    async fn get_by_min_score(&self, threshold: f32) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT ps.uid, ps.created_at
                 FROM prediction_sessions ps
                 JOIN detection_objects d ON ps.uid = d.prediction_uid
                 WHERE d.score >= ?1
                 ORDER BY ps.created_at, ps.uid",
            )
            .map_err(storage_err)?;
        let summaries = collect_summaries(
            stmt.query_map(params![f64::from(threshold)], summary_row)
                .map_err(storage_err)?,
        );
        summaries
    }
}

fn summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn collect_summaries(
    rows: impl Iterator<Item = rusqlite::Result<(String, String)>>,
) -> Result<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    for row in rows {
        let (uid, created_at) = row.map_err(storage_err)?;
        summaries.push(SessionSummary {
            uid,
            created_at: decode_timestamp(&created_at)?,
        });
    }
    Ok(summaries)
}
