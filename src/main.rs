use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use appgroup::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let settings = Settings::from_env()?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "appgroup",
        "appgroup starting: RUST_LOG='{}', http_port={}, data_dir='{}', persist={}, tidy_interval_secs={}",
        rust_log, settings.http_port, settings.data_dir.display(), settings.persist, settings.tidy_interval_secs
    );

    appgroup::server::run(settings).await
}
