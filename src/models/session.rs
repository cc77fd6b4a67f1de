use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in absolute pixel coordinates, `x1 <= x2`, `y1 <= y2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_array(coords: [f32; 4]) -> Self {
        Self {
            x1: coords[0],
            y1: coords[1],
            x2: coords[2],
            y2: coords[3],
        }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    pub fn is_well_formed(&self) -> bool {
        self.x1 <= self.x2 && self.y1 <= self.y2
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// One located object instance as reported by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// A persisted detection row, as read back from a result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    /// Backend-assigned identifier, unique within that backend.
    pub id: String,
    pub prediction_uid: String,
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
    /// 0-based position among the session's detections; preserves the
    /// engine's iteration order for that one run.
    pub sequence_index: u32,
}

/// One processed job's record, with its detections ordered by
/// `sequence_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub original_image_key: String,
    /// Absent when annotation or artifact upload failed.
    pub predicted_image_key: Option<String>,
    pub detections: Vec<DetectionRecord>,
}

/// Listing entry returned by the label and score queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub uid: String,
    pub created_at: DateTime<Utc>,
}
