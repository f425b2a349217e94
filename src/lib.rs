pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod storage;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::{PipelineError, PipelineResult};

pub use logic::{
    ContentStore, DeployPipeline, PipelineSettings, ReclaimReport, Reclaimer, ReclaimerSettings,
};

// Export all model types
pub use model::*;

pub use storage::{MemoryRemote, RemoteStore, TieredFileStore};

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};

use std::sync::Arc;

use crate::config::{AppConfig, DatabaseBackend, DEFAULT_PASSWORD_SECRET};

/// Remote tier from `storage.remote`, when configured and compiled in
pub async fn build_remote(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn RemoteStore>>> {
    let Some(remote) = &config.storage.remote else {
        return Ok(None);
    };

    #[cfg(feature = "s3")]
    {
        let s3 = storage::S3Remote::new(remote.bucket.clone(), remote.prefix.clone()).await?;
        log::info!("Remote tier: s3://{}/{}", remote.bucket, remote.prefix);
        Ok(Some(Arc::new(s3) as Arc<dyn RemoteStore>))
    }

    #[cfg(not(feature = "s3"))]
    {
        anyhow::bail!(
            "storage.remote is set (bucket '{}') but this build has no s3 support",
            remote.bucket
        )
    }
}

/// Wire the pipeline to `store`, start the reclaimer and serve HTTP until
/// the listener fails
pub async fn serve_with_store<S: Store + 'static>(
    store: Arc<S>,
    files: TieredFileStore,
    config: &AppConfig,
) -> anyhow::Result<()> {
    use axum::serve;
    use tokio::net::TcpListener;

    let pipeline = Arc::new(DeployPipeline::new(
        store.clone(),
        files.clone(),
        config.pipeline_settings(),
    ));

    let _reclaimer = if config.reclaimer.enabled {
        let reclaimer = Arc::new(Reclaimer::new(store, files, config.reclaimer_settings()));
        Some(reclaimer.spawn(Some(pipeline.clone())))
    } else {
        log::warn!("Reclaimer disabled, superseded deploys will accumulate");
        None
    };

    let app = crate::api::routes::create_router(config.server.max_upload_bytes).with_state(pipeline);

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    log::info!("Deploy pipeline listening on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}

/// Start the server with the configured backend
pub async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    if config.security.password_secret == DEFAULT_PASSWORD_SECRET {
        log::warn!("security.password_secret is the built-in default; set DEPLOY_SECURITY__PASSWORD_SECRET");
    }

    let remote = build_remote(&config).await?;
    let files = TieredFileStore::new(&config.storage.root, remote)?;
    log::info!("Local storage root: {}", files.root().display());

    match config.database.backend {
        DatabaseBackend::Memory => {
            log::warn!("Using the in-memory store; state is lost on restart");
            serve_with_store(Arc::new(MemoryStore::new()), files, &config).await
        }
        DatabaseBackend::Postgres => {
            let database_url = config.database_url()?;
            let postgres_store =
                PostgresStore::new(&database_url, config.database.max_connections.unwrap_or(20))
                    .await?;

            // Run migrations
            postgres_store.migrate().await?;

            serve_with_store(Arc::new(postgres_store), files, &config).await
        }
    }
}
