mod config;
mod middleware;
mod routes;

use broker_catalog::Catalog;
use broker_common::{BrokerError, Result};
use broker_runtime::{ContainerRuntime, DockerRuntime};
use broker_scheduler::Scheduler;
use broker_store::{RedisStateStore, StateStore};
use clap::{Parser, Subcommand};
use config::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct AppState {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Parser)]
#[command(author, version, about = "Challenge-instance broker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the store/runtime/catalog/scheduler, spawn the control loops,
    /// and serve the HTTP API until shutdown. This is the default.
    Serve,
    /// Build every challenge image found under CHALLENGE_DIR, then exit.
    Prestart,
    /// Flush the state store and stop every container except the named
    /// infrastructure container, then exit.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Prestart => prestart(config).await,
        Commands::Reset => reset(config).await,
    }
}

async fn build_runtime() -> Result<Arc<dyn ContainerRuntime>> {
    let runtime = DockerRuntime::connect_local().map_err(BrokerError::from)?;
    Ok(Arc::new(runtime))
}

async fn serve(config: Config) -> Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(
        RedisStateStore::connect(&config.redis_url())
            .await
            .map_err(BrokerError::from)?,
    );
    let runtime = build_runtime().await?;
    let catalog = Arc::new(Catalog::new(config.challenge_dir.clone(), runtime.clone()));

    info!("loading challenge catalog from {}", config.challenge_dir);
    let loaded = catalog.load().await.map_err(BrokerError::from)?;
    info!(count = loaded.len(), "catalog loaded");

    let scheduler = Arc::new(Scheduler::new(store, runtime, catalog.clone()));

    for challenge in &loaded {
        if challenge.can_prestart {
            if let Err(e) = scheduler.start_instance(&challenge.name, None).await {
                error!(challenge = %challenge.name, error = %e, "failed to seed warm instance at boot");
            }
        }
    }

    let cancel = CancellationToken::new();
    let cleanup_handle = tokio::spawn(broker_scheduler::run_cleanup_loop(
        scheduler.clone(),
        cancel.clone(),
    ));
    let prestart_handle = tokio::spawn(broker_scheduler::run_prestart_loop(
        scheduler.clone(),
        cancel.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        catalog,
        scheduler,
    });
    let app = routes::build_router(state);

    let addr = "0.0.0.0:8080";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BrokerError::Internal(format!("failed to bind {addr}: {e}")))?;
    info!("broker listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| BrokerError::Internal(format!("server error: {e}")))?;

    cancel.cancel();
    let _ = cleanup_handle.await;
    let _ = prestart_handle.await;
    Ok(())
}

async fn prestart(config: Config) -> Result<()> {
    let runtime = build_runtime().await?;
    let catalog = Catalog::new(config.challenge_dir.clone(), runtime);
    let loaded = catalog.load().await.map_err(BrokerError::from)?;
    info!(count = loaded.len(), "prestart: built all challenge images");
    Ok(())
}

async fn reset(config: Config) -> Result<()> {
    let store = RedisStateStore::connect(&config.redis_url())
        .await
        .map_err(BrokerError::from)?;
    store.flush().await.map_err(BrokerError::from)?;

    let runtime = build_runtime().await?;
    let containers = runtime.list_containers().await.map_err(BrokerError::from)?;
    for container in containers {
        if container.name == config.infra_container_name {
            continue;
        }
        if let Err(e) = runtime.stop(&container.id, 5).await {
            error!(container_id = %container.id, error = %e, "reset: failed to stop container");
        }
    }
    info!("reset complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
