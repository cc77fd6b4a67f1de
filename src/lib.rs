pub mod app;
pub mod clients;
pub mod config;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod storage;
pub mod worker;

// Convenient re-exports for tests and external callers
pub use clients::*;
pub use config::*;
pub use inference::*;
pub use models::*;
pub use pipeline::*;
pub use storage::*;
pub use worker::*;
