pub mod session;

pub use session::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("malformed job message: {0}")]
    Decode(String),

    #[error("source object not found: {0}")]
    BlobNotFound(String),

    #[error("blob store error: {0}")]
    BlobRemote(String),

    #[error("model invocation failed: {0}")]
    Inference(String),

    #[error("annotation failed: {0}")]
    Annotation(String),

    #[error("duplicate session uid: {0}")]
    DuplicateKey(String),

    #[error("result store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("no session with uid {0}")]
    SessionNotFound(String),

    #[error("callback delivery failed: {0}")]
    Notify(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// A job descriptor as consumed from the queue.
///
/// `chat_id` is an opaque requester identifier (string or number in
/// practice) that is forwarded verbatim in the completion callback.
#[derive(Debug, Clone, Deserialize)]
pub struct JobMessage {
    pub image_name: String,
    pub chat_id: serde_json::Value,
    pub prediction_id: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl JobMessage {
    pub fn decode(body: &str) -> Result<Self> {
        let message: JobMessage =
            serde_json::from_str(body).map_err(|e| WorkerError::Decode(e.to_string()))?;
        if message.image_name.is_empty() {
            return Err(WorkerError::Decode("image_name is empty".to_string()));
        }
        if message.prediction_id.is_empty() {
            return Err(WorkerError::Decode("prediction_id is empty".to_string()));
        }
        if message.chat_id.is_null() {
            return Err(WorkerError::Decode("chat_id is null".to_string()));
        }
        Ok(message)
    }
}

/// Body of the completion POST sent to the callback target.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    pub chat_id: serde_json::Value,
    pub prediction_id: String,
}
