use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub aws_region: String,
    /// Custom S3/SQS endpoint (e.g. MinIO or LocalStack); unset for AWS.
    pub aws_endpoint: Option<String>,
    pub bucket_name: String,
    pub queue_url: String,
    pub receive_max_messages: i32,
    pub receive_wait_seconds: i32,
    /// "sqlite" or "mongodb"; fixed for the life of the process.
    pub storage_backend: String,
    pub sqlite_path: String,
    pub mongodb_uri: String,
    pub database_name: String,
    /// Base for templated callback targets when a job carries no
    /// callback_url of its own.
    pub callback_base_url: Option<String>,
    pub callback_timeout_ms: u64,
    pub model_path: String,
    pub min_confidence: f32,
    pub upload_dir: String,
    pub predicted_dir: String,
}

impl Config {
    pub fn from_env() -> Self {
        let get = |k: &str| std::env::var(k).ok();

        let port: u16 = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(8081);
        let aws_region = get("AWS_REGION").unwrap_or_else(|| "eu-central-1".to_string());
        let aws_endpoint = get("AWS_ENDPOINT_URL").or_else(|| get("AWS_ENDPOINT"));
        let bucket_name = get("BUCKET_NAME").unwrap_or_else(|| "predictions".to_string());
        let queue_url = get("QUEUE_URL").unwrap_or_default();
        let receive_max_messages: i32 = get("RECEIVE_MAX_MESSAGES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);
        let receive_wait_seconds: i32 = get("RECEIVE_WAIT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);
        let storage_backend = get("STORAGE_BACKEND").unwrap_or_else(|| "sqlite".to_string());
        let sqlite_path = get("SQLITE_PATH").unwrap_or_else(|| "predictions.db".to_string());
        let mongodb_uri =
            get("MONGODB_URI").unwrap_or_else(|| "mongodb://localhost:27017".to_string());
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| "predictions".to_string());
        let callback_base_url = get("CALLBACK_BASE_URL");
        let callback_timeout_ms: u64 = get("CALLBACK_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);
        let model_path = get("MODEL_PATH").unwrap_or_else(|| "yolov8n.onnx".to_string());
        let min_confidence: f32 = get("MIN_CONFIDENCE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.25);
        let upload_dir = get("UPLOAD_DIR").unwrap_or_else(|| "uploads/original".to_string());
        let predicted_dir =
            get("PREDICTED_DIR").unwrap_or_else(|| "uploads/predicted".to_string());

        Self {
            port,
            aws_region,
            aws_endpoint,
            bucket_name,
            queue_url,
            receive_max_messages,
            receive_wait_seconds,
            storage_backend,
            sqlite_path,
            mongodb_uri,
            database_name,
            callback_base_url,
            callback_timeout_ms,
            model_path,
            min_confidence,
            upload_dir,
            predicted_dir,
        }
    }
}
