use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::{extract::Path as AxumPath, routing::post, Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use detection_worker::clients::{BlobStore, CallbackNotifier, JobQueue, QueueMessage};
use detection_worker::inference::{DetectionModel, Prediction};
use detection_worker::models::{
    BoundingBox, Detection, Result as WorkerResult, WorkerError,
};
use detection_worker::pipeline::{JobOutcome, JobPipeline};
use detection_worker::storage::{ResultStore, SqliteResultStore};
use detection_worker::worker::QueueWorker;

// ---------------------------------------------------------------------------
// Fakes at the trait seams
// ---------------------------------------------------------------------------

struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<String>>,
    fail_uploads: bool,
}

impl MemoryBlobStore {
    fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            fail_uploads: false,
        }
    }

    fn with_object(self, key: &str, bytes: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        self
    }

    fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    fn uploaded_keys(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, key: &str) -> WorkerResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| WorkerError::BlobNotFound(key.to_string()))
    }

    async fn upload(&self, local_path: &Path, key: &str) -> WorkerResult<()> {
        if self.fail_uploads {
            return Err(WorkerError::BlobRemote("injected upload fault".to_string()));
        }
        assert!(local_path.exists(), "upload source must be staged locally");
        self.uploads.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

struct FixtureModel {
    detections: Vec<Detection>,
    fail_inference: bool,
    fail_annotation: bool,
}

impl FixtureModel {
    fn reporting(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            fail_inference: false,
            fail_annotation: false,
        }
    }

    fn failing() -> Self {
        Self {
            detections: Vec::new(),
            fail_inference: true,
            fail_annotation: false,
        }
    }

    fn with_broken_annotation(mut self) -> Self {
        self.fail_annotation = true;
        self
    }
}

impl DetectionModel for FixtureModel {
    fn run(&self, image_path: &Path) -> WorkerResult<Prediction> {
        if self.fail_inference {
            return Err(WorkerError::Inference("injected model fault".to_string()));
        }
        let staged = std::fs::read(image_path).map_err(|e| WorkerError::Inference(e.to_string()))?;
        assert!(!staged.is_empty(), "model must see the staged image");

        let annotated_frame = if self.fail_annotation {
            Err(WorkerError::Annotation("injected render fault".to_string()))
        } else {
            // minimal JPEG-looking bytes; the pipeline treats them opaquely
            Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
        };
        Ok(Prediction {
            detections: self.detections.clone(),
            annotated_frame,
        })
    }
}

struct FakeQueue {
    messages: Mutex<Vec<QueueMessage>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeQueue {
    fn preloaded(bodies: Vec<(&str, &str)>) -> Self {
        Self {
            messages: Mutex::new(
                bodies
                    .into_iter()
                    .map(|(receipt, body)| QueueMessage {
                        body: Some(body.to_string()),
                        receipt_handle: Some(receipt.to_string()),
                    })
                    .collect(),
            ),
            deleted: Mutex::new(Vec::new()),
        }
    }

    fn deleted_receipts(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn receive(&self, max_messages: i32, _wait_seconds: i32) -> WorkerResult<Vec<QueueMessage>> {
        let mut queued = self.messages.lock().unwrap();
        let take = (max_messages.max(0) as usize).min(queued.len());
        Ok(queued.drain(..take).collect())
    }

    async fn delete(&self, receipt_handle: &str) -> WorkerResult<()> {
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn cat_detection() -> Detection {
    Detection {
        label: "cat".to_string(),
        score: 0.9,
        bbox: BoundingBox::new(10.0, 10.0, 50.0, 50.0),
    }
}

fn job_body(prediction_id: &str, callback_url: &str) -> String {
    json!({
        "image_name": "cat.jpg",
        "chat_id": "c1",
        "prediction_id": prediction_id,
        "callback_url": callback_url
    })
    .to_string()
}

struct Harness {
    pipeline: JobPipeline,
    store: Arc<SqliteResultStore>,
    blob: Arc<MemoryBlobStore>,
    _scratch: TempDir,
}

fn harness(
    blob: MemoryBlobStore,
    model: FixtureModel,
    callback_base_url: Option<String>,
) -> Harness {
    let scratch = TempDir::new().unwrap();
    let upload_dir = scratch.path().join("original");
    let predicted_dir = scratch.path().join("predicted");
    std::fs::create_dir_all(&upload_dir).unwrap();
    std::fs::create_dir_all(&predicted_dir).unwrap();

    let store = Arc::new(SqliteResultStore::open(scratch.path().join("predictions.db")).unwrap());
    let blob = Arc::new(blob);
    let pipeline = JobPipeline::new(
        blob.clone(),
        Arc::new(model),
        store.clone(),
        CallbackNotifier::new(5_000).unwrap(),
        callback_base_url,
        &upload_dir,
        &predicted_dir,
    );

    Harness {
        pipeline,
        store,
        blob,
        _scratch: scratch,
    }
}

/// Binds an ephemeral server that records every callback POST it receives.
async fn spawn_callback_server(captured: Arc<Mutex<Vec<Value>>>) -> String {
    let sink = captured.clone();
    let app = Router::new()
        .route(
            "/cb",
            post(move |Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    StatusCode::OK
                }
            }),
        )
        .route(
            "/predictions/{id}",
            post(move |AxumPath(id): AxumPath<String>, Json(body): Json<Value>| {
                let sink = captured.clone();
                async move {
                    sink.lock()
                        .unwrap()
                        .push(json!({"path_id": id, "body": body}));
                    StatusCode::OK
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

async fn spawn_failing_callback_server() -> String {
    let app = Router::new().route(
        "/cb",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Pipeline scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn processes_job_end_to_end() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"raw image bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(report.prediction_id, "p1");
    assert_eq!(report.detections, 1);
    assert_eq!(report.predicted_image_key.as_deref(), Some("predicted/p1.jpg"));
    assert!(report.persisted);
    assert!(report.notified);

    // artifact went out under the prediction-derived key
    assert_eq!(h.blob.uploaded_keys(), ["predicted/p1.jpg"]);

    // results are queryable
    let session = h.store.get_by_uid("p1").await.unwrap();
    assert_eq!(session.original_image_key, "cat.jpg");
    assert_eq!(session.predicted_image_key.as_deref(), Some("predicted/p1.jpg"));
    assert_eq!(session.detections.len(), 1);
    let detection = &session.detections[0];
    assert_eq!(detection.label, "cat");
    assert_eq!(detection.score, 0.9);
    assert_eq!(detection.bbox.to_array(), [10.0, 10.0, 50.0, 50.0]);
    assert_eq!(detection.sequence_index, 0);

    let by_label = h.store.get_by_label("cat").await.unwrap();
    assert_eq!(by_label.len(), 1);
    assert_eq!(by_label[0].uid, "p1");

    // exactly one callback with the agreed payload
    let posts = captured.lock().unwrap().clone();
    assert_eq!(posts, vec![json!({"chat_id": "c1", "prediction_id": "p1"})]);
}

#[tokio::test]
async fn forwards_numeric_chat_id_verbatim() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );

    let body = json!({
        "image_name": "cat.jpg",
        "chat_id": 42,
        "prediction_id": "p2",
        "callback_url": format!("{base}/cb")
    })
    .to_string();
    let outcome = h.pipeline.process(&body).await;
    assert!(matches!(outcome, JobOutcome::Completed(_)));

    let posts = captured.lock().unwrap().clone();
    assert_eq!(posts, vec![json!({"chat_id": 42, "prediction_id": "p2"})]);
}

#[tokio::test]
async fn missing_image_aborts_without_side_effects() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new(), // no objects at all
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    match outcome {
        JobOutcome::Aborted {
            prediction_id,
            error,
        } => {
            assert_eq!(prediction_id, "p1");
            assert!(matches!(error, WorkerError::BlobNotFound(_)));
        }
        other => panic!("expected abort, got {other:?}"),
    }

    assert!(matches!(
        h.store.get_by_uid("p1").await.unwrap_err(),
        WorkerError::SessionNotFound(_)
    ));
    assert!(h.blob.uploaded_keys().is_empty());
    assert!(captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn inference_failure_leaves_no_results() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::failing(),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    assert!(matches!(
        outcome,
        JobOutcome::Aborted { error: WorkerError::Inference(_), .. }
    ));
    assert!(matches!(
        h.store.get_by_uid("p1").await.unwrap_err(),
        WorkerError::SessionNotFound(_)
    ));
    assert!(captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn annotation_failure_still_persists_detections() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]).with_broken_annotation(),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert!(report.predicted_image_key.is_none());
    assert!(report.persisted);
    assert!(report.notified);

    let session = h.store.get_by_uid("p1").await.unwrap();
    assert!(session.predicted_image_key.is_none());
    assert_eq!(session.detections.len(), 1);
    assert!(h.blob.uploaded_keys().is_empty());
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn artifact_upload_failure_still_persists() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new()
            .with_object("cat.jpg", b"bytes")
            .failing_uploads(),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert!(report.predicted_image_key.is_none());

    let session = h.store.get_by_uid("p1").await.unwrap();
    assert!(session.predicted_image_key.is_none());
    assert_eq!(session.detections.len(), 1);
}

#[tokio::test]
async fn zero_detection_job_completes() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(Vec::new()),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(report.detections, 0);
    assert!(report.persisted);

    let session = h.store.get_by_uid("p1").await.unwrap();
    assert!(session.detections.is_empty());
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn undecodable_or_incomplete_bodies_are_rejected() {
    let h = harness(
        MemoryBlobStore::new(),
        FixtureModel::reporting(Vec::new()),
        Some("http://polybot.local".to_string()),
    );

    for body in [
        "{not json",
        r#"{"chat_id": "c1", "prediction_id": "p1"}"#,
        r#"{"image_name": "cat.jpg", "prediction_id": "p1"}"#,
        r#"{"image_name": "cat.jpg", "chat_id": null, "prediction_id": "p1"}"#,
    ] {
        let outcome = h.pipeline.process(body).await;
        assert!(
            matches!(outcome, JobOutcome::Rejected(WorkerError::Decode(_))),
            "body {body:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn message_without_callback_target_is_rejected() {
    // no callback_url in the message and no base URL configured
    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(Vec::new()),
        None,
    );

    let body = json!({
        "image_name": "cat.jpg",
        "chat_id": "c1",
        "prediction_id": "p1"
    })
    .to_string();
    let outcome = h.pipeline.process(&body).await;
    assert!(matches!(
        outcome,
        JobOutcome::Rejected(WorkerError::Decode(_))
    ));
    assert!(matches!(
        h.store.get_by_uid("p1").await.unwrap_err(),
        WorkerError::SessionNotFound(_)
    ));
}

#[tokio::test]
async fn base_url_fallback_targets_prediction_route() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        Some(format!("{base}/")), // trailing slash must not double up
    );

    let body = json!({
        "image_name": "cat.jpg",
        "chat_id": "c1",
        "prediction_id": "p9"
    })
    .to_string();
    let outcome = h.pipeline.process(&body).await;
    assert!(matches!(outcome, JobOutcome::Completed(_)));

    let posts = captured.lock().unwrap().clone();
    assert_eq!(
        posts,
        vec![json!({
            "path_id": "p9",
            "body": {"chat_id": "c1", "prediction_id": "p9"}
        })]
    );
}

#[tokio::test]
async fn failed_callback_is_reported_not_fatal() {
    let base = spawn_failing_callback_server().await;

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );

    let outcome = h
        .pipeline
        .process(&job_body("p1", &format!("{base}/cb")))
        .await;

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert!(!report.notified);
    // results survive a lost callback
    assert!(report.persisted);
    assert!(h.store.get_by_uid("p1").await.is_ok());
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn worker_acknowledges_every_message() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;
    let callback = format!("{base}/cb");

    let good = job_body("ok-1", &callback);
    let broken = "{not json".to_string();
    let missing_image = json!({
        "image_name": "nowhere.jpg",
        "chat_id": "c1",
        "prediction_id": "gone-1",
        "callback_url": callback
    })
    .to_string();

    let queue = Arc::new(FakeQueue::preloaded(vec![
        ("r1", good.as_str()),
        ("r2", broken.as_str()),
        ("r3", missing_image.as_str()),
    ]));

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );
    let worker = QueueWorker::new(queue.clone(), h.pipeline, 5, 0);

    assert_eq!(worker.poll_once().await, 3);
    // every message is acknowledged exactly once, failures included
    assert_eq!(queue.deleted_receipts(), ["r1", "r2", "r3"]);
    // the queue is drained
    assert_eq!(worker.poll_once().await, 0);

    // only the successful job produced results and a callback
    assert!(h.store.get_by_uid("ok-1").await.is_ok());
    assert!(h.store.get_by_uid("gone-1").await.is_err());
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn worker_honors_receive_batch_size() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let base = spawn_callback_server(captured.clone()).await;
    let callback = format!("{base}/cb");

    let bodies: Vec<String> = (0..7).map(|i| job_body(&format!("p{i}"), &callback)).collect();
    let preloaded: Vec<(&str, &str)> = [
        ("r0", bodies[0].as_str()),
        ("r1", bodies[1].as_str()),
        ("r2", bodies[2].as_str()),
        ("r3", bodies[3].as_str()),
        ("r4", bodies[4].as_str()),
        ("r5", bodies[5].as_str()),
        ("r6", bodies[6].as_str()),
    ]
    .to_vec();
    let queue = Arc::new(FakeQueue::preloaded(preloaded));

    let h = harness(
        MemoryBlobStore::new().with_object("cat.jpg", b"bytes"),
        FixtureModel::reporting(vec![cat_detection()]),
        None,
    );
    let worker = QueueWorker::new(queue.clone(), h.pipeline, 5, 0);

    assert_eq!(worker.poll_once().await, 5);
    assert_eq!(worker.poll_once().await, 2);
    assert_eq!(queue.deleted_receipts().len(), 7);
    assert_eq!(captured.lock().unwrap().len(), 7);
}
