use anyhow::Result;
use blobdepot::{
    config::AppConfig, db, routes, server::Server, services::storage_service::StorageService,
};
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (cfg, migrate_only) = AppConfig::from_env_and_args()?;
    tracing::info!("starting blobdepot with config: {:?}", cfg);

    fs::create_dir_all(&cfg.storage_dir)?;
    if let Some(parent) = Path::new(&cfg.database_path).parent() {
        fs::create_dir_all(parent)?;
    }

    let pool = db::connect(&cfg.database_path).await?;
    db::run_migrations(&pool).await?;
    if migrate_only {
        tracing::info!("schema applied, exiting");
        return Ok(());
    }

    let storage = StorageService::new(Arc::new(pool), cfg.storage_dir.clone());

    // Drop index entries whose payload went missing while we were down.
    let repaired = storage.reconcile().await?;
    if repaired > 0 {
        tracing::warn!("reconciled {} stale index entries", repaired);
    }

    let app = routes::routes().with_state(storage);
    let mut server = Server::new(app);
    server.start(&cfg.addr()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.stop().await;

    Ok(())
}
