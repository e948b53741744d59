//! Vault Backup Orchestrator Entry Point
//!
//! Wires the entity store, the execution pipeline, and the cron scheduler
//! together, then blocks until a shutdown signal drains the scheduler and
//! exits.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_backup::config::Settings;
use vault_backup::crypto::Codec;
use vault_backup::pipeline::Pipeline;
use vault_backup::providers::registry::Registry;
use vault_backup::scheduler::Scheduler;
use vault_backup::store::Store;
use vault_backup::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    info!("starting vault-backup v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::from_env();
    if let Some(parent) = std::path::Path::new(&settings.store_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(anyhow::Error::from)?;
        }
    }
    let codec = Codec::init()?;
    let store = Arc::new(Store::connect(&format!("sqlite://{}?mode=rwc", settings.store_path), codec).await?);

    let cli_mutex = Arc::new(AsyncMutex::new(()));
    let registry = Arc::new(Registry::new(&settings, cli_mutex.clone()));
    let pipeline = Arc::new(Pipeline::new(settings.clone(), store.clone(), registry, cli_mutex));

    let scheduler = Scheduler::new(&settings, store.clone(), pipeline);
    scheduler.load_tasks().await?;
    scheduler.start();

    #[cfg(feature = "rest-api")]
    {
        let http_store = store.clone();
        let http_scheduler = scheduler.clone();
        let bind_addr = settings.http_bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = vault_backup::api::run_server(&bind_addr, http_store, http_scheduler).await {
                tracing::error!("http adapter error: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await.map_err(anyhow::Error::from)?;
    info!("shutdown signal received, draining scheduler");
    scheduler.stop().await;
    info!("vault-backup stopped");

    Ok(())
}
