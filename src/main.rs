use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use wikipath::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    let config = Config::from_env();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "wikipath",
        "wikipath starting: RUST_LOG='{}', http_port={}, data_dir='{}', api_base='{}', max_depth={}, upstream_concurrency={}, cache_capacity={}",
        rust_log,
        config.http_port,
        config.data_dir,
        config.api_base,
        config.max_depth,
        config.upstream_concurrency_cap,
        config.cache_capacity
    );

    wikipath::server::run(config).await
}
