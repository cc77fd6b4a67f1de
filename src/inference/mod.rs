pub mod annotate;
pub mod engine;
pub mod labels;

pub use annotate::render_annotated;
pub use engine::OrtDetector;
pub use labels::{label_for, COCO_LABELS};

use std::path::Path;

use crate::models::{Detection, Result};

/// Output of one model invocation.
pub struct Prediction {
    pub detections: Vec<Detection>,
    /// JPEG bytes of the frame with detections overlaid. Rendering can fail
    /// independently of detection, so the failure is carried here as a
    /// partial-success outcome instead of failing the whole run.
    pub annotated_frame: Result<Vec<u8>>,
}

/// The detection model behind a seam, so the pipeline can run against fakes.
///
/// Implementations load their weights once at construction; `run` is
/// synchronous and blocks the calling thread.
pub trait DetectionModel: Send + Sync {
    fn run(&self, image_path: &Path) -> Result<Prediction>;
}
