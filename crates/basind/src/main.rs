mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use auth::{
    AuthService, EntitlementOracle, GithubIdentityProvider, LazyOracle, StaticOracle,
    StaticRepoCatalog,
};
use master::PipelineMaster;
use orchestrator::LocalOrchestrator;
use pool::Pool;
use store::Store;

use crate::cli::{Cli, Commands};
use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    match cli.command {
        Commands::Start => start().await,
    }
}

async fn start() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(prefix = %config.store_prefix, "starting basind");

    let store = Store::new();
    let orchestrator = Arc::new(LocalOrchestrator::new());

    // The oracle client is constructed on first use; until a remote
    // entitlement service is wired in, it reports the configured state.
    let entitlement_state = config.entitlement_state;
    let entitlement = Arc::new(LazyOracle::new(move || {
        Box::pin(async move {
            Ok(Arc::new(StaticOracle::new(entitlement_state)) as Arc<dyn EntitlementOracle>)
        })
    }));
    let identity = Arc::new(GithubIdentityProvider::with_api_base(&config.identity_api));
    let repos = Arc::new(StaticRepoCatalog::new());

    let auth = AuthService::new(
        store.clone(),
        &config.store_prefix,
        entitlement,
        identity,
        repos,
    );

    let pipeline_master = PipelineMaster::new(
        store.clone(),
        &config.store_prefix,
        orchestrator.clone(),
        config.master_lease_ttl_secs,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let master_task = tokio::spawn(async move { pipeline_master.run(shutdown_rx).await });

    let worker_pool = Pool::new(orchestrator.clone(), &config.worker_service).await?;

    info!(activated = auth.is_activated(), "basind is up");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    shutdown_tx.send(true).ok();
    master_task.await.ok();
    worker_pool.close();
    Ok(())
}
