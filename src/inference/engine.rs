use std::path::Path;
use std::sync::Mutex;

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayD, Axis, Ix4};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;

use super::{annotate, labels, DetectionModel, Prediction};
use crate::models::{BoundingBox, Detection, Result, WorkerError};

const INPUT_SIZE: u32 = 640;
const IOU_THRESHOLD: f32 = 0.7;

/// YOLOv8-class detector on ONNX Runtime.
///
/// The session is built once at process start and reused for every message;
/// invocation is synchronous and runs on the calling thread.
pub struct OrtDetector {
    session: Mutex<Session>,
    min_confidence: f32,
}

impl OrtDetector {
    pub fn new(model_path: &Path, min_confidence: f32) -> Result<Self> {
        let session = Session::builder()
            .and_then(|builder| builder.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|builder| builder.commit_from_file(model_path))
            .map_err(|e| {
                WorkerError::Configuration(format!(
                    "loading model {}: {e}",
                    model_path.display()
                ))
            })?;
        tracing::info!(model = %model_path.display(), "ONNX session ready");
        Ok(Self {
            session: Mutex::new(session),
            min_confidence,
        })
    }

    fn infer(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| WorkerError::Inference(format!("session mutex poisoned: {e}")))?;

        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| WorkerError::Inference(format!("building input tensor: {e}")))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| WorkerError::Inference(e.to_string()))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| WorkerError::Inference(format!("extracting output tensor: {e}")))?;
        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| WorkerError::Inference(format!("invalid output shape: {e}")))
    }
}

impl DetectionModel for OrtDetector {
    fn run(&self, image_path: &Path) -> Result<Prediction> {
        let frame = image::open(image_path).map_err(|e| {
            WorkerError::Inference(format!("decoding {}: {e}", image_path.display()))
        })?;

        let (input, width, height) = preprocess(&frame);
        let output = self.infer(&input)?;
        let detections =
            non_max_suppression(decode_output(&output, width, height, self.min_confidence));
        let annotated_frame = annotate::render_annotated(&frame, &detections);

        Ok(Prediction {
            detections,
            annotated_frame,
        })
    }
}

/// Resizes to the model's square input and normalizes RGB into NCHW.
fn preprocess(frame: &DynamicImage) -> (Array<f32, Ix4>, u32, u32) {
    let (width, height) = frame.dimensions();
    let resized = frame.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let side = INPUT_SIZE as usize;
    let mut input = Array::zeros((1, 3, side, side));
    for pixel in resized.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = f32::from(r) / 255.;
        input[[0, 1, y, x]] = f32::from(g) / 255.;
        input[[0, 2, y, x]] = f32::from(b) / 255.;
    }
    (input, width, height)
}

/// Decodes the raw `[1, 4 + classes, anchors]` tensor into thresholded
/// candidates scaled back to the original frame.
fn decode_output(
    output: &ArrayD<f32>,
    img_width: u32,
    img_height: u32,
    min_confidence: f32,
) -> Vec<Detection> {
    let mut candidates = Vec::new();
    let view: ndarray::ArrayView2<f32> = output.slice(s![0, .., ..]);

    for anchor in view.axis_iter(Axis(1)) {
        let mut class_id = 0usize;
        let mut score = f32::MIN;
        for (index, value) in anchor.iter().skip(4).copied().enumerate() {
            if value > score {
                class_id = index;
                score = value;
            }
        }
        if score < min_confidence {
            continue;
        }

        let xc = anchor[0] / INPUT_SIZE as f32 * img_width as f32;
        let yc = anchor[1] / INPUT_SIZE as f32 * img_height as f32;
        let w = anchor[2] / INPUT_SIZE as f32 * img_width as f32;
        let h = anchor[3] / INPUT_SIZE as f32 * img_height as f32;

        candidates.push(Detection {
            label: labels::label_for(class_id).to_string(),
            score,
            bbox: BoundingBox::new(xc - w / 2., yc - h / 2., xc + w / 2., yc + h / 2.),
        });
    }
    candidates
}

/// Greedy NMS: keep the highest-scoring candidate, drop everything that
/// overlaps it past the IoU threshold, repeat. Survivor order (score
/// descending) is the order detections are reported and indexed in.
fn non_max_suppression(mut candidates: Vec<Detection>) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept = Vec::new();
    while let Some(best) = candidates.first().cloned() {
        candidates.retain(|other| iou(&best.bbox, &other.bbox) < IOU_THRESHOLD);
        kept.push(best);
    }
    kept
}

fn intersection(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.);
    w * h
}

fn union(a: &BoundingBox, b: &BoundingBox) -> f32 {
    a.width() * a.height() + b.width() * b.height() - intersection(a, b)
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let union = union(a, b);
    if union <= 0. {
        return 0.;
    }
    intersection(a, b) / union
}
