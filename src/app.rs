use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use aws_config::{BehaviorVersion, Region};
use axum::{routing::get, Router};

use crate::clients::{CallbackNotifier, S3BlobStore, SqsJobQueue};
use crate::config::Config;
use crate::inference::OrtDetector;
use crate::models::{Result, WorkerError};
use crate::pipeline::JobPipeline;
use crate::storage::build_result_store;
use crate::worker::QueueWorker;

/// Wires every component and runs the consumption loop until the process is
/// killed. The model, storage handle, and service clients are constructed
/// once here and handed to the pipeline by shared ownership.
pub async fn start_worker() -> Result<()> {
    let cfg = Config::from_env();
    if cfg.queue_url.is_empty() {
        return Err(WorkerError::Configuration("QUEUE_URL must be set".to_string()));
    }
    tracing::info!(
        storage_backend = %cfg.storage_backend,
        bucket = %cfg.bucket_name,
        queue = %cfg.queue_url,
        model = %cfg.model_path,
        "loaded configuration"
    );

    // local scratch areas for staged and annotated frames
    tokio::fs::create_dir_all(&cfg.upload_dir).await?;
    tokio::fs::create_dir_all(&cfg.predicted_dir).await?;

    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(cfg.aws_region.clone()))
        .load()
        .await;
    let blob = Arc::new(S3BlobStore::new(
        &sdk_config,
        cfg.bucket_name.clone(),
        cfg.aws_endpoint.as_deref(),
    ));
    let queue = Arc::new(SqsJobQueue::new(
        &sdk_config,
        cfg.queue_url.clone(),
        cfg.aws_endpoint.as_deref(),
    ));

    let store = build_result_store(&cfg).await?;
    let model = Arc::new(OrtDetector::new(
        Path::new(&cfg.model_path),
        cfg.min_confidence,
    )?);
    let notifier = CallbackNotifier::new(cfg.callback_timeout_ms)?;

    let pipeline = JobPipeline::new(
        blob,
        model,
        store,
        notifier,
        cfg.callback_base_url.clone(),
        Path::new(&cfg.upload_dir),
        Path::new(&cfg.predicted_dir),
    );
    let worker = QueueWorker::new(
        queue,
        pipeline,
        cfg.receive_max_messages,
        cfg.receive_wait_seconds,
    );

    serve_health_endpoint(cfg.port).await?;

    worker.run().await;
    Ok(())
}

/// Liveness probe beside the worker loop; deliberately not a query API.
async fn serve_health_endpoint(port: u16) -> Result<()> {
    let app = Router::new().route("/health", get(health_check));
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| WorkerError::Configuration(format!("bad listen address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(port = port, "health endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "health endpoint terminated");
        }
    });
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
