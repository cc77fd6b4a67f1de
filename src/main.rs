use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load the worker's .env regardless of current working directory
    let _ = dotenvy::dotenv();
    // Initialize logging
    let filter = EnvFilter::from_default_env().add_directive("info".parse().unwrap());
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .init();

    detection_worker::app::start_worker().await?;
    Ok(())
}
