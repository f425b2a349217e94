//! Audit the two storage tiers against the database.
//!
//! Reports remote objects with no local copy and content rows whose blob is
//! missing from both tiers, plus buried reclaim jobs. Read-only unless
//! `--hydrate` is passed, which pulls remote-only content blobs to local disk.

use anyhow::{Context, Result};
use sqlx::Row;
use std::collections::HashSet;

use deploy_pipeline::config::AppConfig;
use deploy_pipeline::storage::paths::DEPLOY_ROOT;
use deploy_pipeline::store::traits::JobStore;
use deploy_pipeline::{build_remote, ContentObject, PostgresStore, TieredFileStore, CONTENT_ROOT};

async fn exists_locally(files: &TieredFileStore, key: &str) -> bool {
    tokio::fs::metadata(files.root().join(key)).await.is_ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let hydrate = std::env::args().any(|arg| arg == "--hydrate");

    let config = AppConfig::load()?;
    let remote = build_remote(&config).await?;
    let files = TieredFileStore::new(&config.storage.root, remote)?;
    if !files.has_remote() {
        println!("No remote tier configured, only checking local content.");
    }

    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, 2)
        .await
        .context("connecting to the deploy database")?;

    println!("Connected. Auditing storage under {}", files.root().display());

    // Remote objects with no local copy
    let mut remote_keys = HashSet::new();
    let mut remote_only = 0usize;
    for prefix in [CONTENT_ROOT, DEPLOY_ROOT] {
        let objects = files.list_remote(prefix).await?;
        println!("{} remote objects under {}/", objects.len(), prefix);
        for object in objects {
            if !exists_locally(&files, &object.key).await {
                remote_only += 1;
                if remote_only <= 50 {
                    println!("  remote only: {} ({} bytes)", object.key, object.size);
                }
            }
            remote_keys.insert(object.key);
        }
    }
    if remote_only > 50 {
        println!("  ... and {} more", remote_only - 50);
    }

    // Content rows whose blob is gone from both tiers
    let hashes: Vec<String> = sqlx::query("SELECT sha256 FROM content_objects ORDER BY id")
        .fetch_all(store.pool())
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("sha256"))
        .collect();
    println!("Checking {} content rows...", hashes.len());

    let mut lost = 0usize;
    let mut hydrated = 0usize;
    for (i, sha256) in hashes.iter().enumerate() {
        if (i + 1) % 1000 == 0 {
            println!("Processed {}/{}", i + 1, hashes.len());
        }
        let key = ContentObject::path_for(sha256);
        if exists_locally(&files, &key).await {
            continue;
        }
        if !remote_keys.contains(&key) {
            lost += 1;
            println!("  lost blob: {}", key);
        } else if hydrate && files.load(&key).await?.is_some() {
            hydrated += 1;
        }
    }

    let buried = store.list_buried_jobs().await?;
    for job in &buried {
        println!(
            "  buried job {}: {} after {} attempts ({})",
            job.id,
            job.identity,
            job.attempts,
            job.last_error.as_deref().unwrap_or("no error recorded")
        );
    }

    println!("\nSummary:");
    println!("  remote-only objects: {}", remote_only);
    println!("  content rows missing from both tiers: {}", lost);
    println!("  buried reclaim jobs: {}", buried.len());
    if hydrate {
        println!("  blobs hydrated locally: {}", hydrated);
    }

    Ok(())
}
