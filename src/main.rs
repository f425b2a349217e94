use deploy_pipeline::config::AppConfig;
use deploy_pipeline::run_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Info by default, sqlx debug output suppressed; RUST_LOG overrides both
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    log::info!(
        "Configuration loaded: server={}:{}, backend={:?}",
        config.server.host,
        config.server.port,
        config.database.backend
    );

    run_server(config).await
}
